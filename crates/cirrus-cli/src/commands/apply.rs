use super::{report_run, runtime, spin_fail, spin_ok, spinner};
use cirrus_core::Engine;
use std::path::Path;

pub fn run(engine: &Engine, spec_path: &Path, json: bool) -> Result<u8, String> {
    let spec = Engine::load_spec(spec_path).map_err(|e| e.to_string())?;
    let rt = runtime()?;

    let pb = if json {
        None
    } else {
        Some(spinner("applying desired spec..."))
    };
    let result = match rt.block_on(engine.apply(&spec)) {
        Ok(r) => r,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "apply failed");
            }
            return Err(e.to_string());
        }
    };
    if let Some(ref pb) = pb {
        if result.report.is_success() {
            spin_ok(pb, &format!("applied: {}", result.plan.summary()));
        } else {
            spin_fail(pb, "apply finished with errors");
        }
    }
    report_run(&result, "apply", json)
}
