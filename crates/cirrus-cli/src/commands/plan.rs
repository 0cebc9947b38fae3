use super::{action_symbol, EXIT_SUCCESS};
use cirrus_core::{Engine, Plan, StepSubject};
use std::path::Path;

pub fn run(engine: &Engine, spec_path: &Path, destroy: bool, json: bool) -> Result<u8, String> {
    let plan = if destroy {
        engine.plan_destroy()
    } else {
        Engine::load_spec(spec_path).and_then(|spec| engine.plan(&spec))
    }
    .map_err(|e| e.to_string())?;

    if json {
        let doc = plan
            .to_json()
            .map_err(|e| format!("JSON serialization failed: {e}"))?;
        println!("{doc}");
    } else {
        print_plan(&plan);
    }
    Ok(EXIT_SUCCESS)
}

fn print_plan(plan: &Plan) {
    if !plan.has_changes() {
        println!("no changes: state matches the desired spec");
        return;
    }
    for level in 0..plan.level_count() {
        let mut steps = plan.level(level).peekable();
        if steps.peek().is_none() {
            continue;
        }
        println!("level {level}:");
        for step in steps {
            let what = match &step.subject {
                StepSubject::Resource { kind, .. } => kind.to_string(),
                StepSubject::Binding(binding) => binding.to_string(),
            };
            println!("  {} {} ({what})", action_symbol(step.action), step.key);
        }
    }
    println!("plan: {}", plan.summary());
}
