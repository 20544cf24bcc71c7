//! Rendering of run snapshots.
//!
//! `render` is the interactive view (colors, spinner, animated banner) and
//! `report` is the plain-text view for pipes and logs. Both are pure: same
//! snapshot, elapsed time and width give the same text.

use gradient_common::snapshot::{DiagnosticView, Phase, RunStatus, Snapshot, SummaryState};
use owo_colors::OwoColorize;
use std::time::Duration;

const BANNER: &str = "gradient engineer";

/// Braille spinner frames
const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const SPINNER_FRAME_MS: u128 = 80;

/// Output lines shown per diagnostic in the details view
const DETAIL_LINES: usize = 12;

const HUE_STEP: f32 = 14.0;
const HUE_SPEED_MS: f32 = 12.0;

pub fn spinner_frame(elapsed: Duration) -> &'static str {
    let idx = (elapsed.as_millis() / SPINNER_FRAME_MS) as usize % SPINNER_FRAMES.len();
    SPINNER_FRAMES[idx]
}

/// HSV with fixed saturation/value to RGB
fn hue_to_rgb(hue: f32) -> (u8, u8, u8) {
    let h = hue.rem_euclid(360.0) / 60.0;
    let (s, v) = (0.55_f32, 1.0_f32);
    let c = v * s;
    let x = c * (1.0 - ((h % 2.0) - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let scale = |f: f32| ((f + m) * 255.0).round() as u8;
    (scale(r), scale(g), scale(b))
}

fn banner(elapsed: Duration) -> String {
    let shift = elapsed.as_millis() as f32 / HUE_SPEED_MS;
    BANNER
        .chars()
        .enumerate()
        .map(|(i, ch)| {
            let (r, g, b) = hue_to_rgb(i as f32 * HUE_STEP + shift);
            ch.truecolor(r, g, b).bold().to_string()
        })
        .collect()
}

fn fit(text: &str, width: usize) -> String {
    if width == 0 || text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn tail(text: &str, lines: usize) -> Vec<&str> {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].to_vec()
}

fn status_icon(status: RunStatus, elapsed: Duration) -> String {
    match status {
        RunStatus::Pending => "·".dimmed().to_string(),
        RunStatus::Running => spinner_frame(elapsed).bright_yellow().to_string(),
        RunStatus::Succeeded => "✓".bright_green().to_string(),
        RunStatus::Failed => "✗".bright_red().to_string(),
    }
}

fn diagnostic_lines(d: &DiagnosticView, details: bool, elapsed: Duration, width: usize) -> Vec<String> {
    let mut label = d.description.clone();
    if d.timed_out {
        label.push_str(" (timed out)");
    }

    let mut lines = vec![format!(
        "  {} {}",
        status_icon(d.status, elapsed),
        fit(&label, width.saturating_sub(4))
    )];

    if let Some(err) = &d.error {
        let first = err.lines().next().unwrap_or_default();
        lines.push(format!(
            "      {}",
            fit(first, width.saturating_sub(6)).bright_red()
        ));
    }

    if details && !d.output.is_empty() {
        for line in tail(&d.output, DETAIL_LINES) {
            lines.push(format!("      {}", fit(line, width.saturating_sub(6)).dimmed()));
        }
    }
    lines
}

/// Interactive view
pub fn render(snapshot: &Snapshot, elapsed: Duration, width: usize) -> String {
    let mut lines = vec![banner(elapsed), String::new()];

    if let Some(id) = &snapshot.playbook {
        lines.push(format!("Playbook {}", id.bold()));
        lines.push(String::new());
    }

    match snapshot.phase {
        Phase::AwaitingBundle => {
            lines.push(format!(
                "{} {}",
                spinner_frame(elapsed).bright_yellow(),
                "Downloading toolbox...".dimmed()
            ));
        }
        Phase::Aborted => {
            if let Some(failure) = &snapshot.failure {
                lines.push(format!("{} {}", "✗".bright_red(), failure.message.bright_red()));
            }
        }
        _ => {}
    }

    for d in &snapshot.diagnostics {
        lines.extend(diagnostic_lines(d, snapshot.show_details, elapsed, width));
    }

    match &snapshot.summary {
        SummaryState::NotStarted => {}
        SummaryState::InFlight { provider } => {
            lines.push(String::new());
            lines.push(format!(
                "{} {}",
                spinner_frame(elapsed).bright_yellow(),
                format!("Summarizing with {}...", provider).dimmed()
            ));
        }
        SummaryState::Ready { text } => {
            lines.push(String::new());
            lines.push("Summary".bold().underline().to_string());
            lines.extend(text.lines().map(|l| l.to_string()));
        }
        SummaryState::Failed { message, .. } => {
            lines.push(String::new());
            lines.push(format!("LLM error: {}", message).bright_red().to_string());
        }
        SummaryState::Skipped { notice } => {
            lines.push(String::new());
            lines.extend(notice.lines().map(|l| l.yellow().to_string()));
        }
    }

    lines.push(String::new());
    let total = snapshot.diagnostics.len();
    let footer = format!(
        "q quit · tab details · {}/{} done · {:.1}s",
        snapshot.completed(),
        total,
        elapsed.as_secs_f32()
    );
    lines.push(fit(&footer, width).dimmed().to_string());

    lines.join("\n")
}

/// Plain-text final report
pub fn report(snapshot: &Snapshot) -> String {
    let mut out = String::new();

    if let Some(failure) = &snapshot.failure {
        out.push_str(&format!("error [{}]: {}\n", failure.code, failure.message));
        return out;
    }

    if let Some(id) = &snapshot.playbook {
        out.push_str(&format!("Playbook {}\n\n", id));
    }

    for d in &snapshot.diagnostics {
        let mark = match d.status {
            RunStatus::Succeeded => "ok",
            RunStatus::Failed => "FAILED",
            RunStatus::Pending | RunStatus::Running => "pending",
        };
        out.push_str(&format!("== [{}] {}", mark, d.description));
        if d.timed_out {
            out.push_str(" (timed out)");
        }
        out.push('\n');
        if let Some(err) = &d.error {
            out.push_str(&format!("{}\n", err.lines().next().unwrap_or_default()));
        }
        if !d.output.is_empty() {
            out.push_str(&d.output);
            out.push('\n');
        }
        out.push('\n');
    }

    match &snapshot.summary {
        SummaryState::Ready { text } => out.push_str(&format!("Summary\n{}\n", text)),
        SummaryState::Failed { message, .. } => out.push_str(&format!("LLM error: {}\n", message)),
        SummaryState::Skipped { notice } => out.push_str(&format!("{}\n", notice)),
        SummaryState::NotStarted | SummaryState::InFlight { .. } => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradient_common::snapshot::FailureView;

    fn view(description: &str, status: RunStatus, output: &str) -> DiagnosticView {
        DiagnosticView {
            index: 0,
            description: description.to_string(),
            invocation: None,
            status,
            output: output.to_string(),
            error: None,
            timed_out: false,
            duration_ms: None,
        }
    }

    fn snapshot(diagnostics: Vec<DiagnosticView>, summary: SummaryState) -> Snapshot {
        Snapshot {
            run_id: "run".to_string(),
            started_at: chrono::Utc::now(),
            playbook: Some("60-second-linux".to_string()),
            phase: Phase::RunningDiagnostics,
            bundle_ready: true,
            diagnostics,
            summary,
            failure: None,
            show_details: false,
            ticks: 0,
        }
    }

    #[test]
    fn test_render_is_pure() {
        let snap = snapshot(
            vec![view("Load average", RunStatus::Running, "")],
            SummaryState::NotStarted,
        );
        let t = Duration::from_millis(1234);
        assert_eq!(render(&snap, t, 80), render(&snap, t, 80));
    }

    #[test]
    fn test_render_lists_diagnostics_and_progress() {
        let snap = snapshot(
            vec![
                view("Load average", RunStatus::Succeeded, "0.10 0.20 0.30"),
                view("Memory", RunStatus::Running, ""),
            ],
            SummaryState::NotStarted,
        );
        let text = render(&snap, Duration::ZERO, 80);
        assert!(text.contains("Load average"));
        assert!(text.contains("Memory"));
        assert!(text.contains("✓"));
        assert!(text.contains("1/2 done"));
        // Output hidden until details are toggled
        assert!(!text.contains("0.10 0.20 0.30"));
    }

    #[test]
    fn test_details_show_output_tail() {
        let mut snap = snapshot(
            vec![view("Load average", RunStatus::Succeeded, "0.10 0.20 0.30")],
            SummaryState::NotStarted,
        );
        snap.show_details = true;
        assert!(render(&snap, Duration::ZERO, 80).contains("0.10 0.20 0.30"));
    }

    #[test]
    fn test_long_descriptions_are_fitted() {
        assert_eq!(fit("abcdef", 4), "abc…");
        assert_eq!(fit("abc", 4), "abc");
        assert_eq!(fit("abcdef", 0), "abcdef");
    }

    #[test]
    fn test_report_is_plain() {
        let snap = snapshot(
            vec![view("Load average", RunStatus::Succeeded, "up 1 day")],
            SummaryState::Ready {
                text: "Host is idle.".to_string(),
            },
        );
        let text = report(&snap);
        assert!(!text.contains('\x1b'));
        assert!(text.contains("== [ok] Load average\nup 1 day\n"));
        assert!(text.contains("Summary\nHost is idle.\n"));
    }

    #[test]
    fn test_report_on_failure() {
        let mut snap = snapshot(Vec::new(), SummaryState::NotStarted);
        snap.phase = Phase::Aborted;
        snap.failure = Some(FailureView {
            code: "source_unavailable".to_string(),
            message: "toolbox source unavailable: x: 404".to_string(),
        });
        assert_eq!(
            report(&snap),
            "error [source_unavailable]: toolbox source unavailable: x: 404\n"
        );
    }

    #[test]
    fn test_hue_wraps() {
        assert_eq!(hue_to_rgb(0.0), hue_to_rgb(360.0));
        assert_eq!(hue_to_rgb(0.0).0, 255);
    }
}
