// relcut Service Library
// Release pipeline engine: matrix builds, trigger control and version propagation

pub mod cache;
pub mod error;
pub mod execution;
pub mod parser;
pub mod runners;
pub mod sink;
pub mod trigger;
pub mod utils;
pub mod version;

// Re-export commonly used types
pub use error::{ConfigError, ServiceError, ServiceResult};

// Re-export parser types
pub use parser::{
    ParseError, ParseErrorKind, ParseResult, PipelineSpec, RuleSet, SpecParser, SpecValidator,
    TriggerEvent, ValidationError, VersionRule,
};

// Re-export execution types
pub use execution::{
    CancelToken, Dispatcher, ExecutionEvent, ExecutorConfig, MatrixExpander, PipelineExecutor,
    PipelineReport, ProgressSender, RunResult, StageGraph,
};

// Re-export runner types
pub use runners::{ShellRunner, StageRunner, UrlAssetSource};

pub use sink::{ArtifactSink, DirectorySink};
pub use trigger::{ConcurrencyController, TriggerDecision, TriggerFilter};
pub use version::{Propagator, RewriteReport};
