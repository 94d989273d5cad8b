use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use relcut_service::execution::artifact_name;
use relcut_service::parser::models::{EventKind, TriggerEvent};
use relcut_service::trigger::resolve_group;
use relcut_service::{MatrixExpander, SpecParser};

/// List matrix combinations with their artifact names
#[derive(Args, Debug)]
pub struct MatrixArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Git ref used to render names
    #[arg(long = "ref", value_name = "REF", default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Print as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: MatrixArgs) -> Result<()> {
    let spec = SpecParser::parse_file(&args.pipeline).map_err(|e| eyre!("Parse error: {}", e))?;
    let event = TriggerEvent::new(EventKind::Manual, args.git_ref.clone());

    let combinations = MatrixExpander::expand(&spec.matrix);
    let group = resolve_group(&spec, &event);

    if args.json {
        let runs: Vec<serde_json::Value> = combinations
            .iter()
            .map(|c| {
                serde_json::json!({
                    "name": c.name(),
                    "values": c
                        .values
                        .iter()
                        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                        .collect::<serde_json::Map<_, _>>(),
                    "artifact_name": artifact_name(&spec, c, &event),
                })
            })
            .collect();
        let doc = serde_json::json!({
            "pipeline": spec.name,
            "cancellation_group": group,
            "runs": runs,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    output::header(&format!(
        "Pipeline '{}': {} run(s), group '{}'",
        spec.name,
        combinations.len(),
        group
    ));
    for combination in &combinations {
        println!(
            "  {:<24} {}",
            combination.name(),
            artifact_name(&spec, combination, &event)
        );
    }

    Ok(())
}
