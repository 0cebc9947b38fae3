pub mod apply;
pub mod completions;
pub mod destroy;
pub mod man_pages;
pub mod plan;
pub mod state;
pub mod validate;
pub mod verify_state;

use cirrus_core::{Action, ApplyResult, RunOutcome, StepState};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_VALIDATION_ERROR: u8 = 1;
pub const EXIT_PARTIAL_FAILURE: u8 = 2;
pub const EXIT_STATE_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start async runtime: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_state(state: StepState) -> String {
    use console::Style;
    let label = state.to_string();
    match state {
        StepState::Applied => Style::new().green().apply_to(label).to_string(),
        StepState::Failed => Style::new().red().bold().apply_to(label).to_string(),
        StepState::Skipped => Style::new().yellow().apply_to(label).to_string(),
        StepState::Unchanged => Style::new().dim().apply_to(label).to_string(),
        StepState::Pending | StepState::Applying => label,
    }
}

pub fn action_symbol(action: Action) -> &'static str {
    match action {
        Action::Create => "+",
        Action::Update => "~",
        Action::Delete => "-",
        Action::NoOp => "=",
    }
}

/// Print the outcome of an apply or destroy run and pick the exit code.
pub fn report_run(result: &ApplyResult, command: &str, json: bool) -> Result<u8, String> {
    let report = &result.report;
    let code = if report.is_success() {
        EXIT_SUCCESS
    } else {
        EXIT_PARTIAL_FAILURE
    };

    if json {
        let payload = serde_json::json!({
            "run_seq": report.run_seq,
            "outcome": report.outcome,
            "summary": result.plan.summary(),
            "recovered": result.recovered,
            "steps": report.steps,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(code);
    }

    for entry in &result.recovered {
        println!(
            "recovered: run {} was interrupted in level {} ({} step(s) re-planned)",
            entry.run_seq,
            entry.level,
            entry.steps.len()
        );
    }
    for step in &report.steps {
        if step.action == Action::NoOp && step.state == StepState::Unchanged {
            continue;
        }
        print!(
            "  {} {:<10} {}",
            action_symbol(step.action),
            colorize_state(step.state),
            step.key
        );
        match &step.error {
            Some(error) => println!(": {error}"),
            None => println!(),
        }
    }

    println!(
        "run {}: {} committed, {} failed, {} skipped, {} not started",
        report.run_seq,
        report.committed().count(),
        report.failed().count(),
        report.skipped().count(),
        report.not_started().count()
    );
    match report.outcome {
        RunOutcome::Succeeded => {}
        RunOutcome::PartiallyFailed => {
            println!("some changes were not applied; fix the errors above and re-run `cirrus {command}`");
        }
        RunOutcome::Aborted => {
            println!("run aborted; committed levels are kept, re-run `cirrus {command}` to continue");
        }
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_state_keeps_label() {
        for state in [
            StepState::Applied,
            StepState::Failed,
            StepState::Skipped,
            StepState::Unchanged,
            StepState::Pending,
        ] {
            assert!(colorize_state(state).contains(&state.to_string()));
        }
    }

    #[test]
    fn action_symbols_are_distinct() {
        let symbols = [
            action_symbol(Action::Create),
            action_symbol(Action::Update),
            action_symbol(Action::Delete),
            action_symbol(Action::NoOp),
        ];
        for (i, a) in symbols.iter().enumerate() {
            for b in &symbols[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_VALIDATION_ERROR);
        assert_ne!(EXIT_VALIDATION_ERROR, EXIT_PARTIAL_FAILURE);
        assert_ne!(EXIT_PARTIAL_FAILURE, EXIT_STATE_ERROR);
    }

    #[test]
    fn runtime_starts() {
        let rt = runtime().unwrap();
        assert_eq!(rt.block_on(async { 2 + 2 }), 4);
    }

    #[test]
    fn spinner_creates_progress_bar() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }
}
