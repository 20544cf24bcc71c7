//! Orchestrator - the run state machine.
//!
//! ```text
//! AwaitingBundle --BundleReady--> RunningDiagnostics --all terminal--> AwaitingSummary --SummaryDone--> Done
//!       |                                   |
//!   BundleFailed                     no summarizer / no diagnostics
//!       v                                   v
//!    Aborted                               Done
//! ```
//!
//! [`Orchestrator::update`] is the only writer of run state. It consumes one
//! message at a time and returns the side effects the driver must perform;
//! it never spawns or blocks itself.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bundle::Bundle;
use crate::error::{ExecError, SummaryError, ToolboxError};
use crate::executor::ExecutionResult;
use crate::resolver::ResolvedCommand;
use crate::snapshot::{DiagnosticView, FailureView, Phase, RunStatus, Snapshot, SummaryState};
use crate::summarize::SummaryPair;

/// Recorded instead of a summary when no provider is configured
pub const NO_PROVIDER_NOTICE: &str = "No API key provided; skipping AI summary.\nSet the API key with OPENAI_API_KEY, OPENROUTER_API_KEY, or ANTHROPIC_API_KEY.";

/// Recorded when the playbook declares no diagnostics
pub const NO_DIAGNOSTICS_NOTICE: &str = "Playbook declares no diagnostics; nothing to summarize.";

/// A fetched, unpacked and resolved toolbox
#[derive(Debug)]
pub struct Prepared {
    pub bundle: Bundle,
    pub commands: Vec<ResolvedCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserInput {
    Quit,
    ToggleDetails,
}

/// Everything the orchestrator reacts to
#[derive(Debug)]
pub enum Message {
    BundleReady(Prepared),
    BundleFailed(ToolboxError),
    ExecutionDone(ExecutionResult),
    SummaryDone(Result<String, SummaryError>),
    Tick,
    UserInput(UserInput),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Reached Done
    Completed,
    /// The operator asked to leave
    Quit,
    /// Acquisition or resolution failed
    Aborted,
}

/// Work requested by a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum Effect {
    Launch {
        cwd: PathBuf,
        commands: Vec<ResolvedCommand>,
    },
    Summarize {
        instruction: String,
        pairs: Vec<SummaryPair>,
    },
    Exit(RunOutcome),
}

#[derive(Debug, Clone)]
struct DiagnosticRun {
    status: RunStatus,
    output: String,
    error: Option<ExecError>,
    timed_out: bool,
    duration: Option<Duration>,
}

impl DiagnosticRun {
    fn running() -> Self {
        Self {
            status: RunStatus::Running,
            output: String::new(),
            error: None,
            timed_out: false,
            duration: None,
        }
    }
}

pub struct Orchestrator {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    phase: Phase,
    bundle: Option<Bundle>,
    commands: Vec<ResolvedCommand>,
    runs: Vec<DiagnosticRun>,
    summary: SummaryState,
    summary_fired: bool,
    /// Provider name; None means summaries are skipped
    summarizer: Option<String>,
    failure: Option<FailureView>,
    show_details: bool,
    exit_when_done: bool,
    ticks: u64,
}

impl Orchestrator {
    pub fn new(summarizer: Option<String>, exit_when_done: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            phase: Phase::AwaitingBundle,
            bundle: None,
            commands: Vec::new(),
            runs: Vec::new(),
            summary: SummaryState::NotStarted,
            summary_fired: false,
            summarizer,
            failure: None,
            show_details: false,
            exit_when_done,
            ticks: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn statuses(&self) -> Vec<RunStatus> {
        self.runs.iter().map(|r| r.status).collect()
    }

    pub fn summary_fired(&self) -> bool {
        self.summary_fired
    }

    /// Hand the bundle back for cleanup
    pub fn take_bundle(&mut self) -> Option<Bundle> {
        self.bundle.take()
    }

    pub fn update(&mut self, message: Message) -> Vec<Effect> {
        match message {
            Message::BundleReady(prepared) => self.on_bundle_ready(prepared),
            Message::BundleFailed(err) => self.on_bundle_failed(err),
            Message::ExecutionDone(result) => self.on_execution_done(result),
            Message::SummaryDone(result) => self.on_summary_done(result),
            Message::Tick => {
                self.ticks = self.ticks.wrapping_add(1);
                Vec::new()
            }
            Message::UserInput(UserInput::Quit) => {
                info!(phase = ?self.phase, "Quit requested");
                vec![Effect::Exit(RunOutcome::Quit)]
            }
            Message::UserInput(UserInput::ToggleDetails) => {
                self.show_details = !self.show_details;
                Vec::new()
            }
        }
    }

    fn on_bundle_ready(&mut self, prepared: Prepared) -> Vec<Effect> {
        if self.phase != Phase::AwaitingBundle {
            warn!(phase = ?self.phase, "Ignoring late bundle");
            return Vec::new();
        }

        let Prepared { bundle, commands } = prepared;
        let cwd = bundle.root().to_path_buf();
        info!(
            playbook = %bundle.playbook().id,
            diagnostics = commands.len(),
            "Launching diagnostics"
        );

        self.runs = commands.iter().map(|_| DiagnosticRun::running()).collect();
        self.commands = commands.clone();
        self.bundle = Some(bundle);
        self.phase = Phase::RunningDiagnostics;

        let mut effects = Vec::new();
        if !commands.is_empty() {
            effects.push(Effect::Launch { cwd, commands });
        }
        effects.extend(self.check_complete());
        effects
    }

    fn on_bundle_failed(&mut self, err: ToolboxError) -> Vec<Effect> {
        if self.phase != Phase::AwaitingBundle {
            warn!(phase = ?self.phase, error = %err, "Ignoring late bundle failure");
            return Vec::new();
        }
        warn!(code = err.code(), "Toolbox acquisition failed: {}", err);
        self.failure = Some(FailureView {
            code: err.code().to_string(),
            message: err.to_string(),
        });
        self.phase = Phase::Aborted;
        vec![Effect::Exit(RunOutcome::Aborted)]
    }

    fn on_execution_done(&mut self, result: ExecutionResult) -> Vec<Effect> {
        if self.phase != Phase::RunningDiagnostics {
            debug!(index = result.index, phase = ?self.phase, "Ignoring execution result");
            return Vec::new();
        }

        let Some(run) = self.runs.get_mut(result.index) else {
            warn!(index = result.index, "Execution result for unknown diagnostic");
            return Vec::new();
        };
        if run.status.is_terminal() {
            warn!(index = result.index, "Duplicate execution result ignored");
            return Vec::new();
        }

        run.duration = Some(result.duration);
        match result.outcome {
            Ok(captured) => {
                run.status = RunStatus::Succeeded;
                run.output = captured.text;
                run.timed_out = captured.timed_out;
            }
            Err(err) => {
                run.status = RunStatus::Failed;
                if let ExecError::CommandFailed { output, .. } = &err {
                    run.output = output.clone();
                }
                run.error = Some(err);
            }
        }

        self.check_complete()
    }

    /// Fire the summary step the first time every diagnostic is terminal
    fn check_complete(&mut self) -> Vec<Effect> {
        if self.summary_fired || !self.runs.iter().all(|r| r.status.is_terminal()) {
            return Vec::new();
        }
        self.summary_fired = true;

        if self.runs.is_empty() {
            self.summary = SummaryState::Skipped {
                notice: NO_DIAGNOSTICS_NOTICE.to_string(),
            };
            return self.finish();
        }

        let Some(provider) = self.summarizer.clone() else {
            info!("All diagnostics finished; no summarizer configured");
            self.summary = SummaryState::Skipped {
                notice: NO_PROVIDER_NOTICE.to_string(),
            };
            return self.finish();
        };

        info!(provider = %provider, "All diagnostics finished; requesting summary");
        self.summary = SummaryState::InFlight { provider };
        self.phase = Phase::AwaitingSummary;
        vec![Effect::Summarize {
            instruction: self.instruction(),
            pairs: self.summary_pairs(),
        }]
    }

    fn on_summary_done(&mut self, result: Result<String, SummaryError>) -> Vec<Effect> {
        if self.phase != Phase::AwaitingSummary {
            warn!(phase = ?self.phase, "Ignoring unexpected summary result");
            return Vec::new();
        }
        self.summary = match result {
            Ok(text) => SummaryState::Ready { text },
            Err(err) => {
                warn!(code = err.code(), "Summary failed: {}", err);
                SummaryState::Failed {
                    code: err.code().to_string(),
                    message: err.to_string(),
                }
            }
        };
        self.finish()
    }

    fn finish(&mut self) -> Vec<Effect> {
        self.phase = Phase::Done;
        if self.exit_when_done {
            vec![Effect::Exit(RunOutcome::Completed)]
        } else {
            Vec::new()
        }
    }

    fn instruction(&self) -> String {
        self.bundle
            .as_ref()
            .and_then(|b| b.playbook().instruction())
            .unwrap_or_default()
            .to_string()
    }

    /// Ordered pairs; failed diagnostics contribute no output
    fn summary_pairs(&self) -> Vec<SummaryPair> {
        self.commands
            .iter()
            .zip(&self.runs)
            .map(|(cmd, run)| SummaryPair {
                description: cmd.description().to_string(),
                output: if run.status == RunStatus::Succeeded {
                    run.output.clone()
                } else {
                    String::new()
                },
            })
            .collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        let diagnostics = self
            .commands
            .iter()
            .zip(&self.runs)
            .map(|(cmd, run)| DiagnosticView {
                index: cmd.index,
                description: cmd.description().to_string(),
                invocation: cmd.invocation.clone(),
                status: run.status,
                output: run.output.clone(),
                error: run.error.as_ref().map(|e| e.to_string()),
                timed_out: run.timed_out,
                duration_ms: run.duration.map(|d| d.as_millis() as u64),
            })
            .collect();

        Snapshot {
            run_id: self.run_id.to_string(),
            started_at: self.started_at,
            playbook: self.bundle.as_ref().map(|b| b.playbook().id.clone()),
            phase: self.phase,
            bundle_ready: self.bundle.is_some(),
            diagnostics,
            summary: self.summary.clone(),
            failure: self.failure.clone(),
            show_details: self.show_details,
            ticks: self.ticks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CapturedOutput;
    use crate::playbook::DiagnosticSpec;
    use std::fs;

    const PLAYBOOK: &str = "id: test-box\nsystem_prompt: Summarize.\ncommands:\n  - command: uptime\n    description: Load\n  - command: free -m\n    description: Memory\n";

    fn prepared(n: usize) -> Prepared {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("toolbox")).unwrap();
        fs::write(dir.path().join("toolbox/playbook.yaml"), PLAYBOOK).unwrap();
        let bundle = Bundle::open(dir).unwrap();
        let commands = (0..n)
            .map(|index| ResolvedCommand {
                index,
                spec: DiagnosticSpec {
                    command: format!("cmd{}", index),
                    description: format!("diag {}", index),
                    timeout_seconds: None,
                },
                invocation: Some(format!("/w/proot -b /w/nix:/nix /bin/cmd{}", index)),
                timeout: Duration::from_secs(5),
            })
            .collect();
        Prepared { bundle, commands }
    }

    fn ok(index: usize, text: &str) -> Message {
        Message::ExecutionDone(ExecutionResult {
            index,
            duration: Duration::from_millis(10),
            outcome: Ok(CapturedOutput {
                text: text.to_string(),
                timed_out: false,
            }),
        })
    }

    fn failed(index: usize) -> Message {
        Message::ExecutionDone(ExecutionResult {
            index,
            duration: Duration::from_millis(10),
            outcome: Err(ExecError::CommandFailed {
                description: format!("diag {}", index),
                exit: "exit status: 1".to_string(),
                output: "partial".to_string(),
            }),
        })
    }

    fn summarize_count(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Summarize { .. }))
            .count()
    }

    #[test]
    fn test_bundle_ready_launches_all() {
        let mut o = Orchestrator::new(Some("fake".into()), false);
        let effects = o.update(Message::BundleReady(prepared(3)));
        assert_eq!(o.phase(), Phase::RunningDiagnostics);
        assert_eq!(o.statuses(), vec![RunStatus::Running; 3]);
        match &effects[..] {
            [Effect::Launch { commands, .. }] => assert_eq!(commands.len(), 3),
            other => panic!("unexpected effects {:?}", other),
        }
    }

    #[test]
    fn test_summary_fires_once_after_last_result() {
        let mut o = Orchestrator::new(Some("fake".into()), false);
        o.update(Message::BundleReady(prepared(3)));

        assert_eq!(summarize_count(&o.update(ok(2, "c"))), 0);
        assert_eq!(summarize_count(&o.update(failed(0))), 0);
        let effects = o.update(ok(1, "b"));
        assert_eq!(summarize_count(&effects), 1);
        assert_eq!(o.phase(), Phase::AwaitingSummary);

        match &effects[0] {
            Effect::Summarize { instruction, pairs } => {
                assert_eq!(instruction, "Summarize.");
                assert_eq!(pairs.len(), 3);
                assert_eq!(pairs[0].output, "");
                assert_eq!(pairs[1].output, "b");
                assert_eq!(pairs[2].output, "c");
            }
            other => panic!("unexpected effect {:?}", other),
        }

        // Late duplicates never re-trigger
        assert!(o.update(ok(1, "again")).is_empty());
        assert!(o.summary_fired());
    }

    #[test]
    fn test_duplicate_result_ignored() {
        let mut o = Orchestrator::new(Some("fake".into()), false);
        o.update(Message::BundleReady(prepared(2)));
        o.update(ok(0, "first"));
        assert!(o.update(failed(0)).is_empty());
        assert_eq!(o.statuses(), vec![RunStatus::Succeeded, RunStatus::Running]);
        assert_eq!(o.snapshot().diagnostics[0].output, "first");
    }

    #[test]
    fn test_out_of_range_result_ignored() {
        let mut o = Orchestrator::new(None, false);
        o.update(Message::BundleReady(prepared(1)));
        assert!(o.update(ok(7, "x")).is_empty());
        assert_eq!(o.phase(), Phase::RunningDiagnostics);
    }

    #[test]
    fn test_no_summarizer_goes_straight_to_done() {
        let mut o = Orchestrator::new(None, true);
        o.update(Message::BundleReady(prepared(1)));
        let effects = o.update(ok(0, "up 3 days"));
        assert_eq!(effects, vec![Effect::Exit(RunOutcome::Completed)]);
        assert_eq!(o.phase(), Phase::Done);
        assert_eq!(
            o.snapshot().summary,
            SummaryState::Skipped {
                notice: NO_PROVIDER_NOTICE.to_string()
            }
        );
    }

    #[test]
    fn test_summary_result_completes_run() {
        let mut o = Orchestrator::new(Some("fake".into()), true);
        o.update(Message::BundleReady(prepared(1)));
        o.update(ok(0, "x"));
        let effects = o.update(Message::SummaryDone(Ok("all fine".into())));
        assert_eq!(effects, vec![Effect::Exit(RunOutcome::Completed)]);
        assert_eq!(
            o.snapshot().summary,
            SummaryState::Ready {
                text: "all fine".into()
            }
        );

        // Done is terminal
        assert!(o.update(Message::SummaryDone(Ok("again".into()))).is_empty());
        assert_eq!(o.phase(), Phase::Done);
    }

    #[test]
    fn test_summary_failure_keeps_results() {
        let mut o = Orchestrator::new(Some("fake".into()), false);
        o.update(Message::BundleReady(prepared(1)));
        o.update(ok(0, "x"));
        o.update(Message::SummaryDone(Err(SummaryError::NoChoicesReturned)));
        let snap = o.snapshot();
        assert_eq!(snap.phase, Phase::Done);
        assert!(matches!(snap.summary, SummaryState::Failed { ref code, .. } if code == "no_choices"));
        assert_eq!(snap.diagnostics[0].output, "x");
    }

    #[test]
    fn test_bundle_failure_aborts() {
        let mut o = Orchestrator::new(Some("fake".into()), false);
        let effects = o.update(Message::BundleFailed(ToolboxError::BinaryNotFound {
            binary: "iostat".into(),
        }));
        assert_eq!(effects, vec![Effect::Exit(RunOutcome::Aborted)]);
        let snap = o.snapshot();
        assert_eq!(snap.phase, Phase::Aborted);
        assert!(snap.diagnostics.is_empty());
        assert_eq!(snap.failure.unwrap().code, "binary_not_found");
        assert!(!o.summary_fired());
    }

    #[test]
    fn test_empty_playbook_finishes_without_summary() {
        let mut o = Orchestrator::new(Some("fake".into()), true);
        let effects = o.update(Message::BundleReady(prepared(0)));
        assert_eq!(effects, vec![Effect::Exit(RunOutcome::Completed)]);
        assert_eq!(o.phase(), Phase::Done);
    }

    #[test]
    fn test_quit_and_toggle() {
        let mut o = Orchestrator::new(None, false);
        assert!(o.update(Message::UserInput(UserInput::ToggleDetails)).is_empty());
        assert!(o.snapshot().show_details);
        assert_eq!(
            o.update(Message::UserInput(UserInput::Quit)),
            vec![Effect::Exit(RunOutcome::Quit)]
        );
    }

    #[test]
    fn test_failed_diagnostic_shows_partial_output() {
        let mut o = Orchestrator::new(None, false);
        o.update(Message::BundleReady(prepared(1)));
        o.update(failed(0));
        let view = &o.snapshot().diagnostics[0];
        assert_eq!(view.status, RunStatus::Failed);
        assert_eq!(view.output, "partial");
        assert!(view.error.as_deref().unwrap().contains("exit status: 1"));
    }
}
