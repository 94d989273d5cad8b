// Execution Engine Module
// Matrix expansion, stage DAG scheduling, cancellation and event dispatch

pub mod cancel;
pub mod context;
pub mod dispatch;
pub mod events;
pub mod executor;
pub mod graph;
pub mod matrix;

// Re-export key types
pub use cancel::CancelToken;
pub use context::{artifact_name, Macros, RunContext};
pub use dispatch::Dispatcher;
pub use events::{progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use executor::{ExecutorConfig, PipelineExecutor, PipelineReport, RunResult};
pub use graph::{GraphError, GraphErrorKind, StageGraph, StageNode};
pub use matrix::{Combination, MatrixExpander};
