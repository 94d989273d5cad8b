use crate::output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;

use relcut_service::execution::{progress_channel, LogLevel};
use relcut_service::parser::models::{EventKind, RunStatus, StageStatus, TriggerEvent};
use relcut_service::trigger::resolve_group;
use relcut_service::{
    DirectorySink, Dispatcher, ExecutionEvent, ExecutorConfig, MatrixExpander, PipelineExecutor,
    PipelineReport, SpecParser,
};

/// Run a release pipeline for one trigger event
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Trigger event as a JSON or YAML file (overrides --kind/--ref/--changed)
    #[arg(long, value_name = "FILE")]
    pub event: Option<PathBuf>,

    /// Event kind: push, pull_request or manual
    #[arg(long, default_value = "manual")]
    pub kind: EventKind,

    /// Git ref of the event, e.g. refs/heads/main or refs/tags/v1.2.0
    #[arg(long = "ref", value_name = "REF", default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Changed path (can be repeated)
    #[arg(long = "changed", value_name = "PATH")]
    pub changed: Vec<String>,

    /// Root for per-run staging directories
    #[arg(long, value_name = "DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Where packaged artifacts are written
    #[arg(long, short = 'o', value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Upload successful artifacts into this directory
    #[arg(long, value_name = "DIR")]
    pub upload_dir: Option<PathBuf>,

    /// Maximum concurrent matrix runs (0 = unlimited)
    #[arg(long, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Default stage timeout
    #[arg(long, value_name = "MINUTES")]
    pub timeout_minutes: Option<u64>,

    /// Build cache root (overrides the pipeline's cache root)
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Print the final report as JSON on stdout instead of progress
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    fn trigger_event(&self) -> Result<TriggerEvent> {
        if let Some(path) = &self.event {
            return SpecParser::parse_event_file(path)
                .map_err(|e| eyre!("Invalid event file: {}", e));
        }
        Ok(TriggerEvent::new(self.kind, self.git_ref.clone()).with_changed_paths(self.changed.clone()))
    }

    fn executor_config(&self) -> ExecutorConfig {
        let mut config = ExecutorConfig::default();
        if let Some(dir) = &self.staging_dir {
            config.staging_root = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(n) = self.max_parallel {
            config.max_parallel_runs = n;
        }
        if let Some(minutes) = self.timeout_minutes {
            config.default_timeout = Duration::from_secs(minutes * 60);
        }
        config.cache_root = self.cache_dir.clone();
        config
    }
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    let event = args.trigger_event()?;

    if !args.json {
        output::status("Parsing", &format!("{}", pipeline_path.display()));
    }
    let spec = SpecParser::parse_file(pipeline_path).map_err(|e| eyre!("Parse error: {}", e))?;

    let (tx, mut rx) = progress_channel();
    let mut executor = PipelineExecutor::from_spec(spec)
        .map_err(|e| eyre!("Invalid pipeline: {}", e))?
        .with_config(args.executor_config())
        .with_progress(tx);
    if let Some(dir) = &args.upload_dir {
        executor = executor.with_sink(Arc::new(DirectorySink::new(dir)));
    }

    let group = {
        let spec = executor.spec();
        if !args.json {
            output::info(&format!(
                "Pipeline '{}': {} stages, {} runs, event {} {}",
                spec.name,
                spec.stages.len(),
                MatrixExpander::count(&spec.matrix),
                event.kind,
                event.git_ref
            ));
        }
        resolve_group(spec, &event)
    };

    let dispatcher = Dispatcher::new(executor);
    let controller = dispatcher.controller().clone();

    // Ctrl-C cancels every run of this invocation's group
    let interrupt = tokio::spawn({
        let group = group.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let cancelled = controller.cancel(&group, "interrupted");
                tracing::warn!(group = %group, cancelled, "interrupt received");
            }
        }
    });

    let exec_handle = tokio::spawn(async move { dispatcher.dispatch(&event).await });

    while let Some(event) = rx.recv().await {
        if !args.json {
            render(&event);
        }
    }

    let report = exec_handle.await?;
    interrupt.abort();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        summarize(&report);
    }

    if !report.success() {
        std::process::exit(1);
    }

    Ok(())
}

fn render(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::PipelineStarted {
            pipeline_name,
            total_runs,
        } => {
            println!();
            output::header(&format!(
                "Pipeline: {} ({} runs)",
                pipeline_name, total_runs
            ));
        }

        ExecutionEvent::PipelineCompleted {
            pipeline_name,
            success,
            duration,
        } => {
            println!();
            let message = format!(
                "Pipeline '{}' {} ({:.2}s)",
                pipeline_name,
                if *success { "succeeded" } else { "failed" },
                duration.as_secs_f64()
            );
            if *success {
                output::success(&message);
            } else {
                output::failure(&message);
            }
        }

        ExecutionEvent::PipelineSkipped {
            pipeline_name,
            reason,
        } => {
            output::warning(&format!("Pipeline '{}' skipped: {}", pipeline_name, reason));
        }

        ExecutionEvent::RunStarted {
            run,
            artifact_name,
            total_stages,
        } => {
            output::run_header(run, artifact_name, *total_stages);
        }

        ExecutionEvent::RunCompleted {
            run,
            status,
            duration,
        } => {
            let line = format!(
                "  Run '{}' {} ({:.2}s)",
                run,
                status.to_string().to_uppercase(),
                duration.as_secs_f64()
            );
            match status {
                RunStatus::Succeeded => output::dim_success(&line),
                RunStatus::Failed => output::dim_failure(&line),
                _ => output::warning(&line),
            }
        }

        ExecutionEvent::StageStarted {
            run,
            stage_name,
            display_name,
        } => {
            let label = display_name.as_deref().unwrap_or(stage_name);
            println!("    [{}] Stage '{}'", run, label);
        }

        ExecutionEvent::StageOutput {
            run,
            output,
            is_error,
            ..
        } => {
            for line in output.lines() {
                if *is_error {
                    output::stage_error(run, line);
                } else {
                    output::stage_output(run, line);
                }
            }
        }

        ExecutionEvent::StageCompleted {
            run,
            stage_name,
            status,
            duration,
            exit_code,
        } => {
            let symbol = match status {
                StageStatus::Succeeded => "OK",
                StageStatus::Failed => "FAIL",
                StageStatus::Cancelled => "CANCELLED",
                _ => "DONE",
            };
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            let line = format!(
                "    [{}] {} {} ({:.2}s){}",
                run,
                stage_name,
                symbol,
                duration.as_secs_f64(),
                exit_info
            );
            match status {
                StageStatus::Succeeded => output::dim_success(&line),
                StageStatus::Failed => output::dim_failure(&line),
                _ => println!("{}", line),
            }
        }

        ExecutionEvent::StageSkipped {
            run,
            stage_name,
            reason,
            ..
        } => {
            output::warning(&format!("    [{}] {} skipped: {}", run, stage_name, reason));
        }

        ExecutionEvent::ArtifactProduced {
            run,
            name,
            sha256,
            size,
        } => {
            output::dim(&format!(
                "    [{}] artifact {} ({} bytes, sha256 {})",
                run, name, size, sha256
            ));
        }

        ExecutionEvent::ArtifactUploaded { run, location, .. } => {
            output::dim(&format!("    [{}] uploaded to {}", run, location));
        }

        ExecutionEvent::Log { level, message, .. } => match level {
            LogLevel::Error => output::error(message),
            LogLevel::Warning => output::warning(message),
            _ => output::dim(message),
        },
    }
}

fn summarize(report: &PipelineReport) {
    if !report.triggered {
        return;
    }

    println!();
    output::status(
        "Summary",
        &format!(
            "{} succeeded, {} failed, {} cancelled",
            report.count(RunStatus::Succeeded),
            report.count(RunStatus::Failed),
            report.count(RunStatus::Cancelled)
        ),
    );
    for run in &report.runs {
        let line = match (&run.artifact, &run.error) {
            (_, Some(error)) => format!("{}: {}", run.combination.name(), error),
            (Some(artifact), None) => format!(
                "{}: {}",
                run.combination.name(),
                run.uploaded.as_deref().unwrap_or(&artifact.name)
            ),
            (None, None) => format!("{}: {}", run.combination.name(), run.status),
        };
        if run.succeeded() {
            output::check(&line);
        } else {
            output::failure(&line);
        }
    }
}
