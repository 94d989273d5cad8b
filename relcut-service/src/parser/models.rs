// Release Pipeline Models
// Data structures for pipeline specs, trigger events, stage results and version rules

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_artifact_name() -> String {
    "$(Pipeline.Product)_$(Matrix.Name)".to_string()
}

fn default_concurrency_group() -> String {
    "$(Pipeline.Name)-$(Event.Ref)".to_string()
}

fn default_cache_key() -> String {
    "$(Pipeline.Name)".to_string()
}

fn default_cache_env() -> Vec<String> {
    vec!["CCACHE_DIR".to_string()]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

/// Accept either `key: value` or `key: [a, b]`
fn deserialize_string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrSeq {
        Single(String),
        Multiple(Vec<String>),
    }

    Ok(match Option::<StringOrSeq>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(StringOrSeq::Single(s)) => vec![s],
        Some(StringOrSeq::Multiple(v)) => v,
    })
}

// =============================================================================
// Trigger Event
// =============================================================================

/// Kind of external event that triggered a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Manual,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Push => write!(f, "push"),
            EventKind::PullRequest => write!(f, "pull_request"),
            EventKind::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(EventKind::PullRequest),
            "manual" | "workflow_dispatch" | "dispatch" => Ok(EventKind::Manual),
            _ => Err(format!(
                "Unknown event kind '{}'. Valid kinds: push, pull_request, manual",
                s
            )),
        }
    }
}

/// An incoming trigger event (immutable once created)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// What kind of event this is
    pub kind: EventKind,

    /// Git ref the event happened on (refs/heads/<branch>, refs/tags/<tag>, or a bare name)
    #[serde(rename = "ref")]
    pub git_ref: String,

    /// Paths touched by the event
    #[serde(default)]
    pub changed_paths: BTreeSet<String>,
}

impl TriggerEvent {
    pub fn new(kind: EventKind, git_ref: impl Into<String>) -> Self {
        Self {
            kind,
            git_ref: git_ref.into(),
            changed_paths: BTreeSet::new(),
        }
    }

    pub fn push(git_ref: impl Into<String>) -> Self {
        Self::new(EventKind::Push, git_ref)
    }

    pub fn manual(git_ref: impl Into<String>) -> Self {
        Self::new(EventKind::Manual, git_ref)
    }

    pub fn pull_request(git_ref: impl Into<String>) -> Self {
        Self::new(EventKind::PullRequest, git_ref)
    }

    pub fn with_changed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Whether the ref points at a tag
    pub fn is_tag(&self) -> bool {
        self.git_ref.starts_with("refs/tags/")
    }

    /// Branch name, if the ref is a branch
    pub fn branch(&self) -> Option<&str> {
        if self.is_tag() {
            None
        } else {
            Some(self.short_ref())
        }
    }

    /// Ref with the refs/heads/ or refs/tags/ prefix removed
    pub fn short_ref(&self) -> &str {
        self.git_ref
            .strip_prefix("refs/heads/")
            .or_else(|| self.git_ref.strip_prefix("refs/tags/"))
            .unwrap_or(&self.git_ref)
    }
}

// =============================================================================
// Pipeline Spec
// =============================================================================

/// Root release pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// Pipeline id, used in artifact names and cancellation groups
    pub name: String,

    /// Product name used in artifact names (defaults to the pipeline name)
    #[serde(default)]
    pub product: Option<String>,

    /// Which events start the pipeline
    #[serde(default)]
    pub trigger: TriggerSpec,

    /// Cancellation grouping
    #[serde(default)]
    pub concurrency: ConcurrencySpec,

    /// Build dimensions, expanded as a Cartesian product
    #[serde(default)]
    pub matrix: Vec<Dimension>,

    /// Pipeline-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Shared compilation cache
    #[serde(default)]
    pub cache: Option<CacheSpec>,

    /// Artifact name template
    #[serde(default = "default_artifact_name")]
    pub artifact_name: String,

    /// Default stage timeout
    #[serde(default)]
    pub timeout_in_minutes: Option<u64>,

    /// Stage graph executed once per combination
    #[serde(default)]
    pub stages: Vec<Stage>,
}

impl Default for PipelineSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            product: None,
            trigger: TriggerSpec::default(),
            concurrency: ConcurrencySpec::default(),
            matrix: Vec::new(),
            env: HashMap::new(),
            cache: None,
            artifact_name: default_artifact_name(),
            timeout_in_minutes: None,
            stages: Vec::new(),
        }
    }
}

impl PipelineSpec {
    /// Product name, falling back to the pipeline name
    pub fn product_name(&self) -> &str {
        self.product.as_deref().unwrap_or(&self.name)
    }

    /// Find a stage by name
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Trigger filter configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    /// Branch globs whose pushes always qualify (full rebuild)
    #[serde(default)]
    pub branches: Vec<String>,

    /// Path globs; other events only qualify when a changed path matches one
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Cancellation group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencySpec {
    /// Key template, e.g. $(Pipeline.Name)-$(Event.Ref)
    #[serde(default = "default_concurrency_group")]
    pub group: String,

    /// Cancel the active run in the group (true) or queue behind it (false)
    #[serde(default = "default_true")]
    pub cancel_in_progress: bool,
}

impl Default for ConcurrencySpec {
    fn default() -> Self {
        Self {
            group: default_concurrency_group(),
            cancel_in_progress: true,
        }
    }
}

/// One axis of the build matrix
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dimension {
    pub name: String,
    pub values: Vec<String>,
}

impl Dimension {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Shared compilation cache exported to the external toolchain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSpec {
    /// Root directory (default: <cache dir>/relcut/build-cache)
    #[serde(default)]
    pub dir: Option<String>,

    /// Key template selecting the cache slot
    #[serde(default = "default_cache_key")]
    pub key: String,

    /// Environment variables set to the resolved cache directory
    #[serde(default = "default_cache_env")]
    pub env: Vec<String>,
}

// =============================================================================
// Stage
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Stage identifier
    pub name: String,

    /// Display name for output
    #[serde(default)]
    pub display_name: Option<String>,

    /// Stages that must succeed first
    #[serde(default, deserialize_with = "deserialize_string_or_seq")]
    pub depends_on: Vec<String>,

    /// Dependents still run when this stage fails
    #[serde(default)]
    pub continue_on_error: bool,

    /// Stage timeout (falls back to the pipeline default)
    #[serde(default)]
    pub timeout_in_minutes: Option<u64>,

    /// Stage-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory relative to the run staging directory
    #[serde(default)]
    pub working_directory: Option<String>,

    /// Artifact file produced by a `run` stage
    #[serde(default)]
    pub produces: Option<ArtifactDescriptor>,

    /// The action to perform (flattened from different stage types)
    #[serde(flatten)]
    pub action: StageAction,
}

impl Stage {
    /// Create a command stage
    pub fn run(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_action(
            name,
            StageAction::Run(RunStage {
                run: command.into(),
            }),
        )
    }

    /// Create a stage with an arbitrary action
    pub fn with_action(name: impl Into<String>, action: StageAction) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            depends_on: Vec::new(),
            continue_on_error: false,
            timeout_in_minutes: None,
            env: HashMap::new(),
            working_directory: None,
            produces: None,
            action,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn continue_on_error(mut self, value: bool) -> Self {
        self.continue_on_error = value;
        self
    }

    pub fn produces(mut self, path: impl Into<String>) -> Self {
        self.produces = Some(ArtifactDescriptor { path: path.into() });
        self
    }

    /// Whether this stage emits the run's artifact
    pub fn is_producer(&self) -> bool {
        self.produces.is_some() || matches!(self.action, StageAction::Package(_))
    }

    /// Label for output (display name or identifier)
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// The specific action a stage performs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageAction {
    /// Command stage: run: cmake --build build
    Run(RunStage),
    /// Asset curation stage: fetch: { assets: [...], prune: [...] }
    Fetch(FetchStage),
    /// Packaging stage: package: { source: build/app, strip: [...] }
    Package(PackageStage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStage {
    pub run: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchStage {
    pub fetch: FetchSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageStage {
    pub package: PackageSpec,
}

/// Assets to download and the files to prune afterwards
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FetchSpec {
    /// Remote assets
    #[serde(default)]
    pub assets: Vec<AssetSpec>,

    /// Directory (relative to staging) receiving the assets
    #[serde(default)]
    pub destination: Option<String>,

    /// Globs (relative to the destination) removed after download
    #[serde(default)]
    pub prune: Vec<String>,

    /// Retry policy applied to each download
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSpec {
    /// http(s):// or file:// URL (macros allowed)
    pub url: String,

    /// File name on disk (defaults to the last URL segment)
    #[serde(default)]
    pub file_name: Option<String>,

    /// Unpack .tar.gz / .tgz archives into the destination
    #[serde(default)]
    pub extract: bool,
}

/// Build output directory to package and the files to strip from it
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PackageSpec {
    /// Bundle directory, relative to staging (macros allowed)
    pub source: String,

    /// Globs (relative to the bundle) removed before compression
    #[serde(default)]
    pub strip: Vec<String>,
}

/// Retry policy for asset downloads
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }
}

/// Artifact file emitted by a run stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Path relative to the run staging directory (macros allowed)
    pub path: String,
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Cancelled
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage_name: String,
    pub status: StageStatus,
    /// Process exit code, when a process ran
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    pub duration: Duration,
    /// Marked failed because a dependency failed (never executed)
    pub propagated: bool,
}

impl StageResult {
    pub fn new(stage_name: impl Into<String>, status: StageStatus) -> Self {
        Self {
            stage_name: stage_name.into(),
            status,
            exit_code: None,
            output: String::new(),
            error: None,
            duration: Duration::ZERO,
            propagated: false,
        }
    }

    pub fn failed(stage_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(stage_name, StageStatus::Failed)
        }
    }

    pub fn cancelled(stage_name: impl Into<String>) -> Self {
        Self::new(stage_name, StageStatus::Cancelled)
    }
}

/// Packaged output of one run
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub path: std::path::PathBuf,
    /// Hex-encoded SHA-256 of the file contents
    pub sha256: String,
    pub size: u64,
}

// =============================================================================
// Version Rules
// =============================================================================

/// A (file glob, match, replacement) triple used by version propagation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionRule {
    /// File glob; without '/' it matches file names anywhere in the tree
    #[serde(rename = "glob")]
    pub file_glob: String,

    /// Text to find; `{old}` expands to the old version
    #[serde(rename = "match")]
    pub match_pattern: String,

    /// Replacement; `{new}` expands to the new version
    #[serde(rename = "replace")]
    pub replacement_template: String,

    /// Treat `match` as a regular expression (`{old}` is inserted escaped)
    #[serde(default)]
    pub regex: bool,
}

impl VersionRule {
    pub fn literal(
        file_glob: impl Into<String>,
        match_pattern: impl Into<String>,
        replacement_template: impl Into<String>,
    ) -> Self {
        Self {
            file_glob: file_glob.into(),
            match_pattern: match_pattern.into(),
            replacement_template: replacement_template.into(),
            regex: false,
        }
    }

    pub fn regex(
        file_glob: impl Into<String>,
        match_pattern: impl Into<String>,
        replacement_template: impl Into<String>,
    ) -> Self {
        Self {
            regex: true,
            ..Self::literal(file_glob, match_pattern, replacement_template)
        }
    }
}

/// Rules file document
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<VersionRule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_refs() {
        let tag = TriggerEvent::push("refs/tags/v1.12.0");
        assert!(tag.is_tag());
        assert_eq!(tag.branch(), None);
        assert_eq!(tag.short_ref(), "v1.12.0");

        let branch = TriggerEvent::push("refs/heads/master");
        assert!(!branch.is_tag());
        assert_eq!(branch.branch(), Some("master"));

        let bare = TriggerEvent::manual("feature/x");
        assert_eq!(bare.branch(), Some("feature/x"));
    }

    #[test]
    fn test_event_kind_from_str() {
        assert_eq!("push".parse::<EventKind>(), Ok(EventKind::Push));
        assert_eq!("pr".parse::<EventKind>(), Ok(EventKind::PullRequest));
        assert_eq!(
            "workflow_dispatch".parse::<EventKind>(),
            Ok(EventKind::Manual)
        );
        assert!("nightly".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_event_json() {
        let json = r#"{"kind":"pull_request","ref":"refs/heads/dev","changed_paths":["a.c"]}"#;
        let event: TriggerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::PullRequest);
        assert!(event.changed_paths.contains("a.c"));
    }

    #[test]
    fn test_stage_action_deserialization() {
        let yaml = r#"
- name: build
  dependsOn: configure
  run: cmake --build build
- name: assets
  fetch:
    assets:
      - url: https://example.com/model.tar.gz
        extract: true
    prune: ["**/*.int8.onnx"]
- name: package
  dependsOn: [build, assets]
  package:
    source: build/app
    strip: ["*.dll"]
"#;
        let stages: Vec<Stage> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].depends_on, vec!["configure"]);
        assert!(matches!(stages[0].action, StageAction::Run(_)));
        match &stages[1].action {
            StageAction::Fetch(f) => {
                assert!(f.fetch.assets[0].extract);
                assert_eq!(f.fetch.retry, RetryPolicy::default());
            }
            other => panic!("expected fetch, got {:?}", other),
        }
        assert!(stages[2].is_producer());
        assert_eq!(stages[2].depends_on, vec!["build", "assets"]);
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("maxAttempts: 5").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_ms, 1000);
        assert_eq!(policy.max_backoff_ms, 30_000);
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }

    #[test]
    fn test_rule_deserialization() {
        let yaml = r#"
rules:
  - glob: "*.yaml"
    match: "{old}"
    replace: "{new}"
  - glob: "CMakeLists.txt"
    match: 'VERSION "{old}"'
    replace: 'VERSION "{new}"'
    regex: false
"#;
        let set: RuleSet = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[1].file_glob, "CMakeLists.txt");
        assert!(!set.rules[1].regex);
    }
}
