use super::{report_run, runtime, spin_fail, spin_ok, spinner};
use cirrus_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, String> {
    let rt = runtime()?;
    let pb = if json {
        None
    } else {
        Some(spinner("destroying recorded resources..."))
    };
    let result = match rt.block_on(engine.destroy()) {
        Ok(r) => r,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "destroy failed");
            }
            return Err(e.to_string());
        }
    };
    if let Some(ref pb) = pb {
        if result.report.is_success() {
            spin_ok(pb, "destroyed");
        } else {
            spin_fail(pb, "destroy finished with errors");
        }
    }
    report_run(&result, "destroy", json)
}
