use super::{json_pretty, EXIT_STATE_ERROR, EXIT_SUCCESS};
use cirrus_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, String> {
    let report = engine.verify_state().map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        println!(
            "state integrity: {}/{} checks passed",
            report.passed, report.checked
        );
        for f in &report.failed {
            println!("  FAIL {}: {}", f.item, f.reason);
        }
        if report.interrupted_levels > 0 {
            println!(
                "  {} interrupted level(s) in the journal; the next apply re-plans them",
                report.interrupted_levels
            );
        }
    }

    if report.failed.is_empty() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_STATE_ERROR)
    }
}
