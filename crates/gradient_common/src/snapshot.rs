//! Read projection of the orchestrator state handed to frontends.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    AwaitingBundle,
    RunningDiagnostics,
    AwaitingSummary,
    Done,
    /// Acquisition or resolution failed; nothing ran
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SummaryState {
    NotStarted,
    InFlight { provider: String },
    Ready { text: String },
    Failed { code: String, message: String },
    /// Summarization was not attempted
    Skipped { notice: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticView {
    pub index: usize,
    pub description: String,
    pub invocation: Option<String>,
    pub status: RunStatus,
    pub output: String,
    pub error: Option<String>,
    pub timed_out: bool,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureView {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub playbook: Option<String>,
    pub phase: Phase,
    pub bundle_ready: bool,
    pub diagnostics: Vec<DiagnosticView>,
    pub summary: SummaryState,
    pub failure: Option<FailureView>,
    pub show_details: bool,
    pub ticks: u64,
}

impl Snapshot {
    pub fn completed(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.status.is_terminal())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.status == RunStatus::Failed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let snapshot = Snapshot {
            run_id: "r1".to_string(),
            started_at: Utc::now(),
            playbook: Some("60-second-linux".to_string()),
            phase: Phase::AwaitingSummary,
            bundle_ready: true,
            diagnostics: vec![DiagnosticView {
                index: 0,
                description: "Load averages".to_string(),
                invocation: None,
                status: RunStatus::Failed,
                output: String::new(),
                error: Some("boom".to_string()),
                timed_out: false,
                duration_ms: Some(12),
            }],
            summary: SummaryState::InFlight {
                provider: "anthropic".to_string(),
            },
            failure: None,
            show_details: false,
            ticks: 3,
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["phase"], "awaiting_summary");
        assert_eq!(value["diagnostics"][0]["status"], "failed");
        assert_eq!(value["summary"]["state"], "in_flight");
        assert_eq!(value["summary"]["provider"], "anthropic");
        assert_eq!(snapshot.completed(), 1);
        assert_eq!(snapshot.failed(), 1);
    }
}
