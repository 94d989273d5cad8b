use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use relcut_service::utils::resolve_working_dir;
use relcut_service::version::{FileStatus, RewriteOutcome};
use relcut_service::{Propagator, RewriteReport, SpecParser};

/// Rewrite every occurrence of the old version across a source tree
#[derive(Args, Debug)]
pub struct PropagateArgs {
    /// Version currently in the tree
    #[arg(long, value_name = "VERSION")]
    pub old: String,

    /// Version to write
    #[arg(long, value_name = "VERSION")]
    pub new: String,

    /// YAML file with the version rules
    #[arg(long, value_name = "FILE")]
    pub rules: PathBuf,

    /// Compute rewrites and verify backups without touching the tree
    #[arg(long)]
    pub dry_run: bool,

    /// Tree root (default: repository root of the current directory)
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Where backups are staged (default: <root>/.relcut-staging)
    #[arg(long, value_name = "DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Fail when two rules match overlapping text
    #[arg(long)]
    pub strict: bool,

    /// Print the report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: PropagateArgs) -> Result<()> {
    let report = match propagate(&args) {
        Ok(report) => report,
        // JSON consumers get an error object instead of a color-eyre report
        Err(e) if args.json => {
            println!("{}", serde_json::to_string_pretty(&error_json(&args, &e))?);
            std::process::exit(2);
        }
        Err(e) => return Err(e),
    };

    if args.json {
        println!("{}", report.to_json()?);
    } else {
        print_report(&report);
    }

    if !report.is_success() {
        std::process::exit(1);
    }

    Ok(())
}

fn propagate(args: &PropagateArgs) -> Result<RewriteReport> {
    let rules = SpecParser::parse_rules_file(&args.rules)
        .map_err(|e| eyre!("Invalid rules file: {}", e))?;

    let root = args.root.clone().unwrap_or_else(resolve_working_dir);
    let mut propagator = Propagator::new(&root)
        .dry_run(args.dry_run)
        .strict(args.strict);
    if let Some(dir) = &args.staging_dir {
        propagator = propagator.with_staging_dir(dir);
    }

    if !args.json {
        output::status(
            "Propagating",
            &format!("{} -> {} in {}", args.old, args.new, root.display()),
        );
    }

    Ok(propagator.propagate(&args.old, &args.new, &rules.rules)?)
}

fn error_json(args: &PropagateArgs, error: &color_eyre::Report) -> serde_json::Value {
    serde_json::json!({
        "outcome": "error",
        "old_version": args.old,
        "new_version": args.new,
        "error": error.to_string(),
    })
}

fn print_report(report: &RewriteReport) {
    for warning in &report.warnings {
        output::warning(warning);
    }

    for file in &report.files {
        let line = format!(
            "{} ({} replacement(s))",
            file.path.display(),
            file.replacements
        );
        match file.status {
            FileStatus::Rewritten => output::check(&line),
            FileStatus::Planned => output::info(&line),
            FileStatus::Failed => output::failure(&format!(
                "{}: {}",
                line,
                file.error.as_deref().unwrap_or("write failed")
            )),
            FileStatus::NotAttempted => output::dim(&format!("    {} not attempted", line)),
        }
    }

    println!();
    match report.outcome {
        RewriteOutcome::Complete => output::success(&format!(
            "{} file(s) updated, {} replacement(s)",
            report.succeeded().len(),
            report.total_replacements()
        )),
        RewriteOutcome::NoChanges => {
            output::success(&format!("Nothing to change; tree is at {}", report.new_version))
        }
        RewriteOutcome::DryRun => output::success(&format!(
            "Dry run: {} file(s) would change, backups verified",
            report.files.len()
        )),
        RewriteOutcome::PartialFailure => {
            output::failure(&format!(
                "{} of {} file(s) failed",
                report.failed().len(),
                report.files.len()
            ));
            if let Some(backups) = &report.backups {
                output::info(&format!(
                    "Backups kept in {}; run `relcut restore --staging-dir {}`",
                    backups.display(),
                    backups.display()
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(rules: &str) -> PropagateArgs {
        PropagateArgs {
            old: "1.11.5".to_string(),
            new: "1.12.0".to_string(),
            rules: PathBuf::from(rules),
            dry_run: true,
            root: None,
            staging_dir: None,
            strict: false,
            json: true,
        }
    }

    #[test]
    fn test_configuration_error_as_json() {
        let args = args("/nonexistent/relcut-rules.yaml");
        let err = propagate(&args).unwrap_err();

        let value = error_json(&args, &err);
        assert_eq!(value["outcome"], "error");
        assert_eq!(value["old_version"], "1.11.5");
        assert_eq!(value["new_version"], "1.12.0");
        assert!(value["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid rules file"));
    }
}
