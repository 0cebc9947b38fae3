use super::{json_pretty, EXIT_SUCCESS};
use cirrus_core::{plan, Engine, ResourceGraph};
use cirrus_store::Snapshot;
use std::path::Path;

pub fn run(spec_path: &Path, json: bool) -> Result<u8, String> {
    let spec = Engine::load_spec(spec_path).map_err(|e| e.to_string())?;
    let graph = ResourceGraph::build(&spec).map_err(|e| format!("validation error: {e}"))?;
    let fresh = plan(&graph, &Snapshot::empty()).map_err(|e| e.to_string())?;
    let bindings = fresh.steps.iter().filter(|s| s.is_binding()).count();

    if json {
        let payload = serde_json::json!({
            "spec": spec_path.display().to_string(),
            "valid": true,
            "resources": graph.len(),
            "bindings": bindings,
            "levels": fresh.level_count(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "{}: valid ({} resource(s), {} binding(s), {} level(s))",
            spec_path.display(),
            graph.len(),
            bindings,
            fresh.level_count()
        );
    }
    Ok(EXIT_SUCCESS)
}
