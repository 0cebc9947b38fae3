use super::{json_pretty, EXIT_SUCCESS};
use cirrus_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, String> {
    let snapshot = engine.snapshot().map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&snapshot)?);
        return Ok(EXIT_SUCCESS);
    }
    if snapshot.is_empty() {
        println!("no resources recorded (run {})", snapshot.run_seq);
        return Ok(EXIT_SUCCESS);
    }

    println!(
        "run {}, commit {}: {} resource(s), {} binding(s)",
        snapshot.run_seq,
        snapshot.commit_seq,
        snapshot.resources.len(),
        snapshot.bindings.len()
    );
    println!("{:<28} {:<18} {:<14} APPLIED", "RESOURCE", "KIND", "HASH");
    for (id, record) in &snapshot.resources {
        let hash: String = record.config_hash.chars().take(12).collect();
        println!(
            "{:<28} {:<18} {:<14} run {}",
            id.as_str(),
            record.kind.as_str(),
            hash,
            record.applied_run
        );
    }
    if !snapshot.bindings.is_empty() {
        println!();
        for (key, record) in &snapshot.bindings {
            println!("{key:<40} {}", record.binding);
        }
    }
    Ok(EXIT_SUCCESS)
}
