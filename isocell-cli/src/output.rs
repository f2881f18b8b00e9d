//! Console and JSON output
//!
//! A progress bar on stderr while the run is in flight, one libtest-style
//! status line per test, then failure sections and a summary line.

use crate::aggregator::{OutcomeStatus, RunOutcomes, TestOutcome};
use crate::planner::Plan;
use crate::runner::RunObserver;
use crate::supervisor::{ExitSignal, GroupOutcome};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Short label used in status lines
pub fn status_label(status: OutcomeStatus) -> &'static str {
    match status {
        OutcomeStatus::Passed => "ok",
        OutcomeStatus::Failed => "FAILED",
        OutcomeStatus::Errored => "ERROR",
        OutcomeStatus::Skipped => "skipped",
        OutcomeStatus::XFailed => "xfail",
        OutcomeStatus::XPassed => "XPASS",
    }
}

/// One status line per finished test, drawn above a progress bar
pub struct Progress {
    bar: ProgressBar,
    quiet: bool,
}

impl Progress {
    /// Progress over `total` tests; `quiet` drops the per-test lines
    pub fn new(total: usize, quiet: bool) -> Self {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(PROGRESS_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Self { bar, quiet }
    }

    /// Remove the bar from the terminal
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl RunObserver for Progress {
    fn plan_ready(&self, plan: &Plan) {
        self.bar.suspend(|| {
            println!(
                "\nrunning {} tests ({} groups, {} in-process)",
                plan.len(),
                plan.groups.len(),
                plan.in_process.len()
            );
        });
    }

    fn test_finished(&self, outcome: &TestOutcome) {
        if !self.quiet {
            self.bar.suspend(|| println!("{}", status_line(outcome)));
        }
        self.bar.set_message(outcome.id.clone());
        self.bar.inc(1);
    }

    fn group_finished(&self, outcome: &GroupOutcome) {
        if matches!(outcome.signal, ExitSignal::Crashed | ExitSignal::TimedOut) {
            self.bar.suspend(|| {
                eprintln!("group '{}' {}", outcome.key, group_verdict(outcome));
            });
        }
    }
}

fn group_verdict(outcome: &GroupOutcome) -> String {
    match (outcome.signal, outcome.signal_number, outcome.exit_code) {
        (ExitSignal::TimedOut, _, _) => {
            format!("timed out after {:.2}s", outcome.duration.as_secs_f64())
        }
        (_, Some(signal), _) => format!("crashed with signal {signal}"),
        (_, None, Some(code)) => format!("crashed with exit code {code}"),
        _ => "crashed".to_string(),
    }
}

/// `test <id> ... <label>`
pub fn status_line(outcome: &TestOutcome) -> String {
    let mut line = format!("test {} ... {}", outcome.id, status_label(outcome.status));
    if let Some(reason) = &outcome.skip_reason {
        let _ = write!(line, " ({reason})");
    }
    line
}

/// Failure sections for every failing or erroring test
pub fn failure_report(run: &RunOutcomes) -> String {
    let failing: Vec<&TestOutcome> = run
        .outcomes
        .iter()
        .filter(|o| o.status.is_failure())
        .collect();
    if failing.is_empty() {
        return String::new();
    }

    let mut out = String::from("\nfailures:\n");
    for outcome in &failing {
        let _ = writeln!(out, "\n---- {} ----", outcome.id);
        if let Some(group) = &outcome.group {
            let _ = writeln!(out, "group: {group}");
        }
        if let Some(kind) = outcome.error_kind {
            let _ = writeln!(out, "kind: {kind}");
        }
        if let Some(message) = &outcome.failure_message {
            let _ = writeln!(out, "{message}");
        }
        if let Some(traceback) = &outcome.traceback {
            let _ = writeln!(out, "{traceback}");
        }
        if !outcome.stdout.is_empty() {
            let _ = writeln!(out, "---- stdout ----\n{}", outcome.stdout.trim_end());
        }
        if !outcome.stderr.is_empty() {
            let _ = writeln!(out, "---- stderr ----\n{}", outcome.stderr.trim_end());
        }
    }

    out.push_str("\nfailures:\n");
    for outcome in &failing {
        let _ = writeln!(out, "    {}", outcome.id);
    }
    out
}

/// `test result: ...` line
pub fn summary_line(run: &RunOutcomes, elapsed: Duration) -> String {
    let verdict = if run.has_failures() { "FAILED" } else { "ok" };
    format!(
        "test result: {verdict}. {} passed; {} failed; {} errors; {} skipped; {} xfailed; {} xpassed; finished in {:.2}s",
        run.count(OutcomeStatus::Passed),
        run.count(OutcomeStatus::Failed),
        run.count(OutcomeStatus::Errored),
        run.count(OutcomeStatus::Skipped),
        run.count(OutcomeStatus::XFailed),
        run.count(OutcomeStatus::XPassed),
        elapsed.as_secs_f64(),
    )
}

/// Tree view of a plan, used by `list`
pub fn format_plan(plan: &Plan) -> String {
    let mut out = String::from("isocell plan:\n");
    for group in &plan.groups {
        let _ = writeln!(
            out,
            "├── group: {} (timeout {}s)",
            group.key,
            group.timeout.as_secs()
        );
        for item in &group.items {
            let _ = writeln!(out, "│   ├── {}", item.id);
        }
    }
    if !plan.in_process.is_empty() {
        out.push_str("├── in-process\n");
        for item in &plan.in_process {
            let _ = writeln!(out, "│   ├── {}", item.id);
        }
    }
    let _ = writeln!(
        out,
        "{} tests found, {} isolated groups.",
        plan.len(),
        plan.groups.len()
    );
    out
}

/// Write the outward outcome records as pretty JSON
pub fn write_json(path: &Path, run: &RunOutcomes) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&run.outcomes)?;
    std::fs::write(path, json)?;
    Ok(())
}
