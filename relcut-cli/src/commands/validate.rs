use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use relcut_service::{MatrixExpander, SpecParser, SpecValidator, StageGraph, TriggerFilter};

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    // Step 1: Parse YAML syntax
    output::status("Validating", &format!("{}", pipeline_path.display()));

    let spec = match SpecParser::parse_file(pipeline_path) {
        Ok(spec) => spec,
        Err(e) => {
            output::error(&format!("Parse error: {}", e));
            if let Some(suggestion) = &e.suggestion {
                output::info(&format!("  Suggestion: {}", suggestion));
            }
            std::process::exit(1);
        }
    };

    output::check("YAML syntax valid");

    // Step 2: Semantic validation
    match SpecValidator::validate(&spec) {
        Ok(()) => output::check("Semantic validation passed"),
        Err(errors) => {
            output::error(&format!("{} validation error(s):", errors.len()));
            for error in &errors {
                output::error(&format!("  - [{}] {}", error.path, error.message));
                if let Some(suggestion) = &error.suggestion {
                    output::info(&format!("    Suggestion: {}", suggestion));
                }
            }
            std::process::exit(1);
        }
    }

    // Step 3: Stage graph
    let graph = match StageGraph::from_spec(&spec) {
        Ok(graph) => graph,
        Err(e) => {
            output::error(&format!("Stage graph: {}", e));
            std::process::exit(1);
        }
    };
    let levels = graph.parallel_stages();
    output::check(&format!(
        "Stage graph: {} stages in {} levels",
        graph.len(),
        levels.len()
    ));
    for (i, level) in levels.iter().enumerate() {
        let names: Vec<&str> = level.iter().map(|node| node.name()).collect();
        output::dim(&format!("    {}: {}", i + 1, names.join(", ")));
    }

    // Step 4: Trigger filters
    if let Err(e) = TriggerFilter::from_spec(&spec.trigger) {
        output::error(&format!("Trigger: {}", e));
        std::process::exit(1);
    }
    output::check(&format!(
        "Trigger: {} branch filter(s), {} path filter(s)",
        spec.trigger.branches.len(),
        spec.trigger.paths.len()
    ));

    let runs = MatrixExpander::count(&spec.matrix);
    let producers = graph.producers().len();
    output::check(&format!(
        "Matrix: {} dimension(s), {} run(s)",
        spec.matrix.len(),
        runs
    ));
    if producers == 0 {
        output::warning("No stage produces an artifact; runs will upload nothing");
    }

    println!();
    output::success(&format!("Pipeline '{}' is valid", spec.name));

    Ok(())
}
