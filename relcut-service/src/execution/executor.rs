// Pipeline Executor
// Expands the matrix and runs every combination's stage graph independently

use crate::cache::BuildCache;
use crate::error::{ServiceError, ServiceResult};
use crate::execution::cancel::CancelToken;
use crate::execution::context::{sanitize_name, RunContext};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::{StageGraph, StageNode};
use crate::execution::matrix::{Combination, MatrixExpander};
use crate::parser::loader::SpecValidator;
use crate::parser::models::{
    Artifact, PipelineSpec, RunStatus, Stage, StageAction, StageResult, StageStatus, TriggerEvent,
};
use crate::runners::{
    AssetFetcher, AssetSource, Packager, ShellRunner, StageInvocation, StageRunner, UrlAssetSource,
};
use crate::sink::ArtifactSink;
use crate::trigger::{resolve_group, TriggerDecision, TriggerFilter};
use crate::utils::data_dir;

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Result of one matrix combination
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub combination: Combination,
    pub artifact_name: String,
    pub cancellation_group: String,
    pub status: RunStatus,
    /// Stage results in declared order
    pub stages: Vec<StageResult>,
    pub artifact: Option<Artifact>,
    /// Sink location, once uploaded
    pub uploaded: Option<String>,
    /// Run-level failure not attributable to a stage (staging, upload)
    pub error: Option<String>,
    pub duration: Duration,
}

impl RunResult {
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Result of one pipeline invocation
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub pipeline_name: String,
    pub cancellation_group: String,
    /// False when trigger filtering skipped the event
    pub triggered: bool,
    pub skip_reason: Option<String>,
    /// One entry per combination, in matrix order
    pub runs: Vec<RunResult>,
    pub duration: Duration,
}

impl PipelineReport {
    fn skipped(pipeline_name: &str, group: String, reason: String) -> Self {
        Self {
            pipeline_name: pipeline_name.to_string(),
            cancellation_group: group,
            triggered: false,
            skip_reason: Some(reason),
            runs: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Every run succeeded (a skipped event counts as success)
    pub fn success(&self) -> bool {
        self.runs.iter().all(|r| r.succeeded())
    }

    pub fn cancelled(&self) -> bool {
        self.runs.iter().any(|r| r.status == RunStatus::Cancelled)
    }

    pub fn artifacts(&self) -> Vec<&Artifact> {
        self.runs.iter().filter_map(|r| r.artifact.as_ref()).collect()
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }

    pub fn run(&self, name: &str) -> Option<&RunResult> {
        self.runs.iter().find(|r| r.combination.name() == name)
    }
}

/// Configuration for pipeline execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-run staging directories live under `<staging_root>/<pipeline>/<combination>`
    pub staging_root: PathBuf,
    /// Where packaged artifacts are written
    pub output_dir: PathBuf,
    /// Stage timeout when neither the stage nor the pipeline sets one
    pub default_timeout: Duration,
    /// Maximum concurrent runs (0 = unlimited)
    pub max_parallel_runs: usize,
    /// Overrides the build cache root from the pipeline
    pub cache_root: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            staging_root: data_dir().join("staging"),
            output_dir: PathBuf::from("dist"),
            default_timeout: Duration::from_secs(60 * 60),
            max_parallel_runs: 0,
            cache_root: None,
        }
    }
}

/// Pipeline executor. Cloning is cheap; clones share the pipeline and collaborators.
#[derive(Clone)]
pub struct PipelineExecutor {
    spec: Arc<PipelineSpec>,
    graph: Arc<StageGraph>,
    filter: Arc<TriggerFilter>,
    config: ExecutorConfig,
    event_tx: Option<ProgressSender>,
    runner: Arc<dyn StageRunner>,
    fetcher: AssetFetcher,
    sink: Option<Arc<dyn ArtifactSink>>,
}

impl PipelineExecutor {
    /// Validate a pipeline and build an executor. Every configuration error is
    /// reported here, before anything runs.
    pub fn from_spec(spec: PipelineSpec) -> ServiceResult<Self> {
        SpecValidator::validate(&spec).map_err(ServiceError::Validation)?;
        let graph = StageGraph::from_spec(&spec)?;
        let filter = TriggerFilter::from_spec(&spec.trigger)?;

        Ok(Self {
            spec: Arc::new(spec),
            graph: Arc::new(graph),
            filter: Arc::new(filter),
            config: ExecutorConfig::default(),
            event_tx: None,
            runner: Arc::new(ShellRunner::new()),
            fetcher: AssetFetcher::new(Arc::new(UrlAssetSource::new())),
            sink: None,
        })
    }

    /// Set executor configuration
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Replace the stage command runner
    pub fn with_runner(mut self, runner: Arc<dyn StageRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Replace the asset source used by `fetch` stages
    pub fn with_asset_source(mut self, source: Arc<dyn AssetSource>) -> Self {
        self.fetcher = AssetFetcher::new(source);
        self
    }

    /// Upload successful artifacts to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Whether `event` passes trigger filtering
    pub fn evaluate(&self, event: &TriggerEvent) -> TriggerDecision {
        self.filter.evaluate(event)
    }

    /// Run every combination for `event`. Runs are independent: a failing
    /// combination never stops its siblings. Cancelling `cancel` stops all of them.
    pub async fn execute(&self, event: &TriggerEvent, cancel: &CancelToken) -> PipelineReport {
        let start = Instant::now();
        let name = self.spec.name.clone();
        let group = resolve_group(&self.spec, event);

        if let TriggerDecision::Skip(reason) = self.filter.evaluate(event) {
            tracing::info!(pipeline = %name, %reason, "event filtered out");
            self.event_tx
                .send_event(ExecutionEvent::pipeline_skipped(&name, reason.clone()));
            return PipelineReport::skipped(&name, group, reason);
        }

        let combinations = MatrixExpander::expand(&self.spec.matrix);
        self.event_tx
            .send_event(ExecutionEvent::pipeline_started(&name, combinations.len()));
        tracing::info!(pipeline = %name, runs = combinations.len(), %group, "pipeline started");

        let limit = match self.config.max_parallel_runs {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        let mut contexts = Vec::with_capacity(combinations.len());
        let mut handles = Vec::with_capacity(combinations.len());
        for combination in combinations {
            let ctx = self.run_context(combination, event, &group);
            let this = self.clone();
            let run_ctx = ctx.clone();
            let cancel = cancel.clone();
            let limit = limit.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match limit {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                this.execute_run(run_ctx, &cancel).await
            }));
            contexts.push(ctx);
        }

        let joined = futures::future::join_all(handles).await;
        let runs: Vec<RunResult> = joined
            .into_iter()
            .zip(contexts)
            .map(|(joined, ctx)| match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(run = %ctx.run_label(), error = %e, "run task aborted");
                    self.aborted_run(&ctx, e.to_string())
                }
            })
            .collect();

        let duration = start.elapsed();
        let report = PipelineReport {
            pipeline_name: name.clone(),
            cancellation_group: group,
            triggered: true,
            skip_reason: None,
            runs,
            duration,
        };

        self.event_tx.send_event(ExecutionEvent::pipeline_completed(
            &name,
            report.success(),
            duration,
        ));
        tracing::info!(
            pipeline = %name,
            succeeded = report.count(RunStatus::Succeeded),
            failed = report.count(RunStatus::Failed),
            cancelled = report.count(RunStatus::Cancelled),
            "pipeline finished"
        );

        report
    }

    fn run_context(&self, combination: Combination, event: &TriggerEvent, group: &str) -> RunContext {
        let staging = self
            .config
            .staging_root
            .join(sanitize_name(&self.spec.name))
            .join(sanitize_name(&combination.name()));
        RunContext::new(
            &self.spec,
            combination,
            event,
            staging,
            self.config.output_dir.clone(),
        )
        .with_cancellation_group(group)
    }

    /// Execute one combination's stage graph level by level
    async fn execute_run(&self, mut ctx: RunContext, cancel: &CancelToken) -> RunResult {
        let start = Instant::now();
        let run = ctx.run_label();

        self.event_tx.send_event(ExecutionEvent::run_started(
            &run,
            &ctx.artifact_name,
            self.graph.len(),
        ));

        if let Err(e) = reset_dir(&ctx.staging_dir).await {
            let message = format!(
                "failed to prepare staging directory '{}': {}",
                ctx.staging_dir.display(),
                e
            );
            return self
                .complete_run(&ctx, Vec::new(), None, Some(message), cancel, start)
                .await;
        }

        if let Some(cache_spec) = &self.spec.cache {
            let cache = match &self.config.cache_root {
                Some(root) => BuildCache::new(root),
                None => BuildCache::from_spec(cache_spec),
            };
            ctx.env.extend(cache.prepare(cache_spec, &ctx));
        }

        let mut results: HashMap<String, StageResult> = HashMap::new();
        let mut artifact = None;

        for level in self.graph.parallel_stages() {
            let mut runnable = Vec::new();

            for node in level {
                match self.blocked_reason(node, &results, cancel) {
                    Some(result) => {
                        self.event_tx.send_event(ExecutionEvent::stage_skipped(
                            &run,
                            &result.stage_name,
                            result.status,
                            result.error.clone().unwrap_or_default(),
                        ));
                        results.insert(result.stage_name.clone(), result);
                    }
                    None => runnable.push(node),
                }
            }

            let executed = futures::future::join_all(
                runnable
                    .iter()
                    .map(|node| self.execute_stage(&node.stage, &ctx, cancel)),
            )
            .await;

            for (result, produced) in executed {
                if produced.is_some() {
                    artifact = produced;
                }
                results.insert(result.stage_name.clone(), result);
            }
        }

        let stages = self
            .graph
            .stages
            .iter()
            .filter_map(|node| results.remove(node.name()))
            .collect();

        self.complete_run(&ctx, stages, artifact, None, cancel, start)
            .await
    }

    /// Why a stage cannot start, as its final result
    fn blocked_reason(
        &self,
        node: &StageNode,
        results: &HashMap<String, StageResult>,
        cancel: &CancelToken,
    ) -> Option<StageResult> {
        if cancel.is_cancelled() {
            return Some(cancelled_result(node.name(), cancel));
        }

        for dep in &node.dependencies {
            let Some(result) = results.get(dep) else {
                continue;
            };
            match result.status {
                StageStatus::Succeeded => {}
                StageStatus::Cancelled => return Some(cancelled_result(node.name(), cancel)),
                _ => {
                    let tolerated = self
                        .graph
                        .get_stage(dep)
                        .map(|d| d.stage.continue_on_error)
                        .unwrap_or(false);
                    if !tolerated {
                        let mut failed =
                            StageResult::failed(node.name(), format!("dependency '{}' failed", dep));
                        failed.propagated = true;
                        return Some(failed);
                    }
                }
            }
        }

        None
    }

    /// Run one stage under its timeout, racing cancellation
    async fn execute_stage(
        &self,
        stage: &Stage,
        ctx: &RunContext,
        cancel: &CancelToken,
    ) -> (StageResult, Option<Artifact>) {
        let start = Instant::now();
        let run = ctx.run_label();
        let timeout = self.stage_timeout(stage);

        self.event_tx.send_event(ExecutionEvent::stage_started(
            &run,
            &stage.name,
            stage.display_name.clone(),
        ));
        tracing::debug!(run = %run, stage = %stage.name, "stage started");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            finished = tokio::time::timeout(timeout, self.perform(stage, ctx)) => Some(finished),
        };

        let (mut result, artifact) = match outcome {
            None => (cancelled_result(&stage.name, cancel), None),
            Some(Err(_)) => (
                StageResult::failed(
                    &stage.name,
                    format!("timed out after {}s", timeout.as_secs_f64()),
                ),
                None,
            ),
            Some(Ok(work)) => work.into_result(&stage.name),
        };
        result.duration = start.elapsed();

        match result.status {
            StageStatus::Failed => tracing::warn!(
                run = %run,
                stage = %stage.name,
                error = result.error.as_deref().unwrap_or(""),
                "stage failed"
            ),
            _ => tracing::debug!(run = %run, stage = %stage.name, status = %result.status, "stage finished"),
        }

        self.event_tx.send_event(ExecutionEvent::stage_completed(
            &run,
            &stage.name,
            result.status,
            result.duration,
            result.exit_code,
        ));
        if let Some(artifact) = &artifact {
            self.event_tx.send_event(ExecutionEvent::artifact_produced(
                &run,
                &artifact.name,
                &artifact.sha256,
                artifact.size,
            ));
        }

        (result, artifact)
    }

    /// The stage's action itself
    async fn perform(&self, stage: &Stage, ctx: &RunContext) -> StageWork {
        match &stage.action {
            StageAction::Run(action) => {
                let invocation = StageInvocation {
                    run: ctx.run_label(),
                    stage_name: stage.name.clone(),
                    command: ctx.substitute(&action.run),
                    working_dir: ctx.stage_dir(stage),
                    env: ctx.stage_env(stage),
                    combination: ctx.combination.clone(),
                    progress: self.event_tx.clone(),
                };
                let outcome = self.runner.run(&invocation).await;
                let succeeded = outcome.success();

                let mut work = StageWork {
                    exit_code: outcome.exit_code,
                    output: outcome.stdout,
                    error: None,
                    artifact: None,
                };
                if !succeeded {
                    work.error = Some(match outcome.exit_code {
                        Some(code) => format!("exited with code {}", code),
                        None if outcome.stderr.is_empty() => "process did not exit".to_string(),
                        None => outcome.stderr,
                    });
                    return work;
                }

                if let Some(produces) = &stage.produces {
                    let produced = ctx.resolve_path(&produces.path);
                    let collect_ctx = ctx.clone();
                    match blocking(move || Packager::collect(&produced, &collect_ctx)).await {
                        Ok(artifact) => work.artifact = Some(artifact),
                        Err(e) => work.error = Some(e),
                    }
                }
                work
            }
            StageAction::Fetch(action) => match self.fetcher.fetch(&action.fetch, ctx).await {
                Ok(report) => StageWork::output(report.summary()),
                Err(e) => StageWork::error(e.to_string()),
            },
            StageAction::Package(action) => {
                let spec = action.package.clone();
                let package_ctx = ctx.clone();
                match blocking(move || Packager::package(&spec, &package_ctx)).await {
                    Ok(artifact) => StageWork {
                        output: format!("packaged {} ({} bytes)", artifact.name, artifact.size),
                        artifact: Some(artifact),
                        ..Default::default()
                    },
                    Err(e) => StageWork::error(e),
                }
            }
        }
    }

    fn stage_timeout(&self, stage: &Stage) -> Duration {
        stage
            .timeout_in_minutes
            .or(self.spec.timeout_in_minutes)
            .map(|m| Duration::from_secs(m * 60))
            .unwrap_or(self.config.default_timeout)
    }

    /// Decide the run status, upload or discard the artifact and emit completion
    async fn complete_run(
        &self,
        ctx: &RunContext,
        stages: Vec<StageResult>,
        artifact: Option<Artifact>,
        error: Option<String>,
        cancel: &CancelToken,
        start: Instant,
    ) -> RunResult {
        let failed = error.is_some()
            || stages.iter().any(|s| {
                s.status == StageStatus::Failed
                    && !self
                        .graph
                        .get_stage(&s.stage_name)
                        .map(|n| n.stage.continue_on_error)
                        .unwrap_or(false)
            });
        let cancelled = stages.iter().any(|s| s.status == StageStatus::Cancelled);

        let status = if cancelled && cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        let artifact = match status {
            RunStatus::Succeeded => artifact,
            _ => {
                if let Some(discarded) = artifact {
                    if let Err(e) = std::fs::remove_file(&discarded.path) {
                        tracing::warn!(path = %discarded.path.display(), error = %e, "failed to discard artifact");
                    }
                }
                None
            }
        };

        let mut result = RunResult {
            combination: ctx.combination.clone(),
            artifact_name: ctx.artifact_name.clone(),
            cancellation_group: ctx.cancellation_group.clone(),
            status,
            stages,
            artifact,
            uploaded: None,
            error,
            duration: Duration::ZERO,
        };

        if result.succeeded() {
            self.upload(&mut result).await;
        }
        result.duration = start.elapsed();

        self.event_tx.send_event(ExecutionEvent::run_completed(
            ctx.run_label(),
            result.status,
            result.duration,
        ));
        tracing::info!(run = %ctx.run_label(), status = %result.status, "run finished");

        result
    }

    fn aborted_run(&self, ctx: &RunContext, message: String) -> RunResult {
        RunResult {
            combination: ctx.combination.clone(),
            artifact_name: ctx.artifact_name.clone(),
            cancellation_group: ctx.cancellation_group.clone(),
            status: RunStatus::Failed,
            stages: Vec::new(),
            artifact: None,
            uploaded: None,
            error: Some(message),
            duration: Duration::ZERO,
        }
    }

    /// Upload a succeeded run's artifact. A failed upload fails the run.
    async fn upload(&self, result: &mut RunResult) {
        let (Some(sink), Some(artifact)) = (&self.sink, &result.artifact) else {
            return;
        };
        let run = result.combination.name();

        let uploaded = match tokio::fs::read(&artifact.path).await {
            Ok(bytes) => sink
                .upload(&artifact.name, bytes)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(format!("failed to read '{}': {}", artifact.path.display(), e)),
        };

        match uploaded {
            Ok(ack) => {
                tracing::info!(run = %run, artifact = %artifact.name, location = %ack.location, "artifact uploaded");
                self.event_tx.send_event(ExecutionEvent::artifact_uploaded(
                    &run,
                    &artifact.name,
                    &ack.location,
                ));
                result.uploaded = Some(ack.location);
            }
            Err(message) => {
                tracing::error!(run = %run, artifact = %artifact.name, error = %message, "upload failed");
                self.event_tx.send_event(ExecutionEvent::error(
                    format!("upload of {} failed: {}", artifact.name, message),
                    Some(run.clone()),
                    None,
                ));
                result.status = RunStatus::Failed;
                result.error = Some(format!("upload failed: {}", message));
            }
        }
    }
}

/// Raw outcome of a stage action
#[derive(Debug, Default)]
struct StageWork {
    exit_code: Option<i32>,
    output: String,
    error: Option<String>,
    artifact: Option<Artifact>,
}

impl StageWork {
    fn output(output: String) -> Self {
        Self {
            output,
            ..Default::default()
        }
    }

    fn error(error: String) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    fn into_result(self, stage_name: &str) -> (StageResult, Option<Artifact>) {
        let status = if self.error.is_some() {
            StageStatus::Failed
        } else {
            StageStatus::Succeeded
        };
        let mut result = StageResult::new(stage_name, status);
        result.exit_code = self.exit_code;
        result.output = self.output;
        result.error = self.error;
        let artifact = if status == StageStatus::Succeeded {
            self.artifact
        } else {
            None
        };
        (result, artifact)
    }
}

fn cancelled_result(stage_name: &str, cancel: &CancelToken) -> StageResult {
    let mut result = StageResult::cancelled(stage_name);
    result.error = cancel.reason();
    result
}

/// Run blocking packaging work off the async runtime
async fn blocking<F, E>(f: F) -> Result<Artifact, String>
where
    F: FnOnce() -> Result<Artifact, E> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(e) => Err(format!("packaging task failed: {}", e)),
    }
}

/// Empty a staging directory, creating it if needed
async fn reset_dir(dir: &std::path::Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::progress_channel;
    use crate::parser::models::{Dimension, PackageSpec, PackageStage, TriggerSpec};
    use crate::runners::StageOutcome;
    use crate::sink::{DirectorySink, SinkAck, SinkError};
    use parking_lot::Mutex;
    use std::path::Path;

    /// Records stage start/end, fails selected (run, stage) pairs and can
    /// create files in the working directory on success
    #[derive(Default)]
    struct ScriptedRunner {
        log: Mutex<Vec<String>>,
        failures: Vec<(String, String)>,
        delays: HashMap<String, Duration>,
        creates: Vec<(String, String)>,
        active: Mutex<usize>,
        peak: Mutex<usize>,
    }

    impl ScriptedRunner {
        fn failing(mut self, run: &str, stage: &str) -> Self {
            self.failures.push((run.to_string(), stage.to_string()));
            self
        }

        fn delay(mut self, stage: &str, delay: Duration) -> Self {
            self.delays.insert(stage.to_string(), delay);
            self
        }

        fn creating(mut self, stage: &str, path: &str) -> Self {
            self.creates.push((stage.to_string(), path.to_string()));
            self
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }

        fn position(&self, entry: &str) -> usize {
            self.log()
                .iter()
                .position(|e| e == entry)
                .unwrap_or_else(|| panic!("missing log entry {}", entry))
        }
    }

    #[async_trait::async_trait]
    impl StageRunner for ScriptedRunner {
        async fn run(&self, invocation: &StageInvocation) -> StageOutcome {
            let tag = format!("{}/{}", invocation.run, invocation.stage_name);
            self.log.lock().push(format!("start {}", tag));
            {
                let mut active = self.active.lock();
                *active += 1;
                let mut peak = self.peak.lock();
                *peak = (*peak).max(*active);
            }

            if let Some(delay) = self.delays.get(&invocation.stage_name) {
                tokio::time::sleep(*delay).await;
            } else {
                tokio::task::yield_now().await;
            }

            *self.active.lock() -= 1;
            self.log.lock().push(format!("end {}", tag));

            let fails = self
                .failures
                .iter()
                .any(|(run, stage)| *run == invocation.run && *stage == invocation.stage_name);
            if fails {
                return StageOutcome::exited(2);
            }

            for (stage, path) in &self.creates {
                if *stage == invocation.stage_name {
                    let target = invocation.working_dir.join(path);
                    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
                    std::fs::write(&target, &invocation.command).unwrap();
                }
            }
            StageOutcome::exited(0).with_stdout(invocation.command.clone())
        }
    }

    struct RejectingSink;

    #[async_trait::async_trait]
    impl ArtifactSink for RejectingSink {
        async fn upload(&self, name: &str, _bytes: Vec<u8>) -> Result<SinkAck, SinkError> {
            Err(SinkError::Rejected {
                name: name.to_string(),
                message: "quota exceeded".to_string(),
            })
        }
    }

    fn release_spec() -> PipelineSpec {
        PipelineSpec {
            name: "whisper-release".to_string(),
            product: Some("whisper".to_string()),
            matrix: vec![
                Dimension::new("os", ["macos"]),
                Dimension::new("arch", ["x86_64", "arm64"]),
            ],
            stages: vec![
                Stage::run("configure", "cmake -B build -DARCH=$(arch)"),
                Stage::run("build", "cmake --build build").depends_on(["configure"]),
                Stage::with_action(
                    "package",
                    StageAction::Package(PackageStage {
                        package: PackageSpec {
                            source: "bundle".to_string(),
                            strip: Vec::new(),
                        },
                    }),
                )
                .depends_on(["build"]),
            ],
            ..Default::default()
        }
    }

    fn config(dir: &Path) -> ExecutorConfig {
        ExecutorConfig {
            staging_root: dir.join("staging"),
            output_dir: dir.join("out"),
            default_timeout: Duration::from_secs(30),
            max_parallel_runs: 0,
            cache_root: None,
        }
    }

    fn executor(spec: PipelineSpec, dir: &Path, runner: Arc<ScriptedRunner>) -> PipelineExecutor {
        PipelineExecutor::from_spec(spec)
            .unwrap()
            .with_config(config(dir))
            .with_runner(runner)
    }

    #[tokio::test]
    async fn test_arm64_build_failure_propagates_to_package() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::default()
                .failing("macos_arm64", "build")
                .creating("build", "bundle/whisper"),
        );
        let sink = Arc::new(DirectorySink::new(dir.path().join("uploads")));
        let exec = executor(release_spec(), dir.path(), runner.clone()).with_sink(sink);

        let report = exec
            .execute(&TriggerEvent::manual("main"), &CancelToken::new())
            .await;

        assert!(report.triggered);
        assert_eq!(report.runs.len(), 2);
        assert!(!report.success());

        let x86 = report.run("macos_x86_64").unwrap();
        assert_eq!(x86.status, RunStatus::Succeeded);
        let artifact = x86.artifact.as_ref().unwrap();
        assert_eq!(artifact.name, "whisper_macos_x86_64.tar.gz");
        assert!(artifact.path.is_file());
        assert!(dir.path().join("uploads/whisper_macos_x86_64.tar.gz").is_file());
        assert!(x86.uploaded.is_some());

        let arm = report.run("macos_arm64").unwrap();
        assert_eq!(arm.status, RunStatus::Failed);
        assert!(arm.artifact.is_none());
        assert_eq!(arm.stage("configure").unwrap().status, StageStatus::Succeeded);
        assert_eq!(arm.stage("build").unwrap().status, StageStatus::Failed);
        assert_eq!(arm.stage("build").unwrap().exit_code, Some(2));
        let package = arm.stage("package").unwrap();
        assert_eq!(package.status, StageStatus::Failed);
        assert!(package.propagated);

        assert_eq!(report.artifacts().len(), 1);
        assert!(!dir.path().join("out/whisper_macos_arm64.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_no_fail_fast_across_combinations() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = release_spec();
        spec.matrix = vec![
            Dimension::new("os", ["linux", "macos"]),
            Dimension::new("arch", ["x86_64", "arm64"]),
        ];
        let runner = Arc::new(
            ScriptedRunner::default()
                .failing("linux_arm64", "configure")
                .creating("build", "bundle/whisper"),
        );
        let report = executor(spec, dir.path(), runner)
            .execute(&TriggerEvent::manual("main"), &CancelToken::new())
            .await;

        assert_eq!(report.runs.len(), 4);
        assert_eq!(report.count(RunStatus::Succeeded), 3);
        assert_eq!(report.count(RunStatus::Failed), 1);
        assert_eq!(report.artifacts().len(), 3);

        let names: Vec<String> = report.runs.iter().map(|r| r.combination.name()).collect();
        assert_eq!(
            names,
            vec!["linux_x86_64", "linux_arm64", "macos_x86_64", "macos_arm64"]
        );
    }

    #[tokio::test]
    async fn test_dependencies_finish_before_dependents_start() {
        let dir = tempfile::tempdir().unwrap();
        let spec = PipelineSpec {
            name: "diamond".to_string(),
            stages: vec![
                Stage::run("fetch", "a"),
                Stage::run("lib", "b").depends_on(["fetch"]),
                Stage::run("sdk", "c").depends_on(["fetch"]),
                Stage::run("app", "d").depends_on(["lib", "sdk"]),
            ],
            ..Default::default()
        };
        let runner = Arc::new(ScriptedRunner::default().delay("lib", Duration::from_millis(30)));
        let report = executor(spec, dir.path(), runner.clone())
            .execute(&TriggerEvent::manual("main"), &CancelToken::new())
            .await;

        assert!(report.success());
        let pos = |e: &str| runner.position(e);
        assert!(pos("end default/fetch") < pos("start default/lib"));
        assert!(pos("end default/fetch") < pos("start default/sdk"));
        assert!(pos("end default/lib") < pos("start default/app"));
        assert!(pos("end default/sdk") < pos("start default/app"));
        // Siblings on the same level overlap
        assert!(pos("start default/sdk") < pos("end default/lib"));
    }

    #[tokio::test]
    async fn test_continue_on_error_lets_dependents_run() {
        let dir = tempfile::tempdir().unwrap();
        let spec = PipelineSpec {
            name: "app".to_string(),
            stages: vec![
                Stage::run("lint", "lint").continue_on_error(true),
                Stage::run("build", "build").depends_on(["lint"]),
            ],
            ..Default::default()
        };
        let runner = Arc::new(ScriptedRunner::default().failing("default", "lint"));
        let report = executor(spec, dir.path(), runner.clone())
            .execute(&TriggerEvent::manual("main"), &CancelToken::new())
            .await;

        let run = &report.runs[0];
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.stage("lint").unwrap().status, StageStatus::Failed);
        assert_eq!(run.stage("build").unwrap().status, StageStatus::Succeeded);
        assert!(runner.log().contains(&"start default/build".to_string()));
    }

    #[tokio::test]
    async fn test_cancellation_marks_stages_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::default()
                .delay("build", Duration::from_secs(30))
                .creating("build", "bundle/whisper"),
        );
        let (tx, mut rx) = progress_channel();
        let exec = executor(release_spec(), dir.path(), runner.clone()).with_progress(tx);
        let cancel = CancelToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { exec.execute(&TriggerEvent::manual("main"), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel("superseded");

        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(report.cancelled());
        for run in &report.runs {
            assert_eq!(run.status, RunStatus::Cancelled);
            assert_eq!(run.stage("configure").unwrap().status, StageStatus::Succeeded);
            assert_eq!(run.stage("build").unwrap().status, StageStatus::Cancelled);
            assert_eq!(run.stage("package").unwrap().status, StageStatus::Cancelled);
            assert!(run.artifact.is_none());
        }
        assert!(!runner.log().iter().any(|e| e.starts_with("end") && e.ends_with("/build")));

        let mut completed = 0;
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::RunCompleted { status, .. } = event {
                assert_eq!(status, RunStatus::Cancelled);
                completed += 1;
            }
        }
        assert_eq!(completed, 2);
    }

    #[tokio::test]
    async fn test_stage_timeout_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let spec = PipelineSpec {
            name: "app".to_string(),
            stages: vec![Stage::run("build", "make")],
            ..Default::default()
        };
        let runner = Arc::new(ScriptedRunner::default().delay("build", Duration::from_secs(30)));
        let mut cfg = config(dir.path());
        cfg.default_timeout = Duration::from_millis(50);
        let report = PipelineExecutor::from_spec(spec)
            .unwrap()
            .with_config(cfg)
            .with_runner(runner)
            .execute(&TriggerEvent::manual("main"), &CancelToken::new())
            .await;

        let run = &report.runs[0];
        assert_eq!(run.status, RunStatus::Failed);
        let build = run.stage("build").unwrap();
        assert_eq!(build.status, StageStatus::Failed);
        assert!(build.error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_upload_failure_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = release_spec();
        spec.matrix = vec![Dimension::new("arch", ["x86_64"])];
        let runner = Arc::new(ScriptedRunner::default().creating("build", "bundle/whisper"));
        let report = executor(spec, dir.path(), runner)
            .with_sink(Arc::new(RejectingSink))
            .execute(&TriggerEvent::manual("main"), &CancelToken::new())
            .await;

        let run = &report.runs[0];
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_ref().unwrap().contains("quota exceeded"));
        assert!(run.uploaded.is_none());
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_run_stage_produces_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let spec = PipelineSpec {
            name: "app".to_string(),
            product: Some("whisper".to_string()),
            matrix: vec![Dimension::new("arch", ["arm64"])],
            stages: vec![Stage::run("bundle", "make dmg $(arch)").produces("dist/app.dmg")],
            ..Default::default()
        };
        let runner = Arc::new(ScriptedRunner::default().creating("bundle", "dist/app.dmg"));
        let report = executor(spec, dir.path(), runner)
            .execute(&TriggerEvent::manual("main"), &CancelToken::new())
            .await;

        let artifact = report.runs[0].artifact.as_ref().unwrap();
        assert_eq!(artifact.name, "whisper_arm64.dmg");
        assert_eq!(std::fs::read_to_string(&artifact.path).unwrap(), "make dmg arm64");
    }

    #[tokio::test]
    async fn test_max_parallel_runs_bounds_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let spec = PipelineSpec {
            name: "app".to_string(),
            matrix: vec![Dimension::new("arch", ["a", "b", "c", "d"])],
            stages: vec![Stage::run("build", "make")],
            ..Default::default()
        };
        let runner = Arc::new(ScriptedRunner::default().delay("build", Duration::from_millis(20)));
        let mut cfg = config(dir.path());
        cfg.max_parallel_runs = 1;
        let report = PipelineExecutor::from_spec(spec)
            .unwrap()
            .with_config(cfg)
            .with_runner(runner.clone())
            .execute(&TriggerEvent::manual("main"), &CancelToken::new())
            .await;

        assert_eq!(report.count(RunStatus::Succeeded), 4);
        assert_eq!(*runner.peak.lock(), 1);
    }

    #[tokio::test]
    async fn test_filtered_event_creates_no_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = release_spec();
        spec.trigger = TriggerSpec {
            branches: Vec::new(),
            paths: vec!["src/**".to_string()],
        };
        let runner = Arc::new(ScriptedRunner::default());
        let event = TriggerEvent::push("feature").with_changed_paths(["docs/index.md"]);
        let report = executor(spec, dir.path(), runner.clone())
            .execute(&event, &CancelToken::new())
            .await;

        assert!(!report.triggered);
        assert!(report.skip_reason.is_some());
        assert!(report.runs.is_empty());
        assert!(runner.log().is_empty());
    }

    #[test]
    fn test_invalid_spec_is_rejected_before_execution() {
        let spec = PipelineSpec {
            name: "app".to_string(),
            stages: vec![
                Stage::run("a", "x").depends_on(["b"]),
                Stage::run("b", "y").depends_on(["a"]),
            ],
            ..Default::default()
        };
        let err = PipelineExecutor::from_spec(spec).err().unwrap();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_run_environment_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let spec = PipelineSpec {
            name: "app".to_string(),
            matrix: vec![Dimension::new("arch", ["arm64"])],
            cache: Some(crate::parser::models::CacheSpec {
                dir: None,
                key: "$(Pipeline.Name)-$(arch)".to_string(),
                env: vec!["CCACHE_DIR".to_string()],
            }),
            stages: vec![Stage::run("build", "make")],
            ..Default::default()
        };

        struct EnvProbe(Mutex<HashMap<String, String>>);

        #[async_trait::async_trait]
        impl StageRunner for EnvProbe {
            async fn run(&self, invocation: &StageInvocation) -> StageOutcome {
                *self.0.lock() = invocation.env.clone();
                StageOutcome::exited(0)
            }
        }

        let probe = Arc::new(EnvProbe(Mutex::new(HashMap::new())));
        let mut cfg = config(dir.path());
        cfg.cache_root = Some(dir.path().join("cache"));
        PipelineExecutor::from_spec(spec)
            .unwrap()
            .with_config(cfg)
            .with_runner(probe.clone())
            .execute(&TriggerEvent::manual("main"), &CancelToken::new())
            .await;

        let env = probe.0.lock().clone();
        assert_eq!(env.get("MATRIX_ARCH").map(String::as_str), Some("arm64"));
        assert_eq!(env.get("RELCUT_STAGE").map(String::as_str), Some("build"));
        assert_eq!(
            env.get("CCACHE_DIR"),
            Some(&dir.path().join("cache/app-arm64").display().to_string())
        );
    }
}
