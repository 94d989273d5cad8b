// Execution Events
// Progress reporting for pipeline runs, stages and artifacts

use crate::parser::models::{RunStatus, StageStatus};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during pipeline execution.
/// `run` is the combination name (e.g. macos_arm64).
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Trigger accepted, matrix expanded
    PipelineStarted {
        pipeline_name: String,
        total_runs: usize,
    },

    /// All runs terminal
    PipelineCompleted {
        pipeline_name: String,
        success: bool,
        duration: Duration,
    },

    /// Trigger filter rejected the event
    PipelineSkipped {
        pipeline_name: String,
        reason: String,
    },

    RunStarted {
        run: String,
        artifact_name: String,
        total_stages: usize,
    },

    RunCompleted {
        run: String,
        status: RunStatus,
        duration: Duration,
    },

    StageStarted {
        run: String,
        stage_name: String,
        display_name: Option<String>,
    },

    /// Process output (stdout/stderr)
    StageOutput {
        run: String,
        stage_name: String,
        output: String,
        is_error: bool,
    },

    StageCompleted {
        run: String,
        stage_name: String,
        status: StageStatus,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Stage never executed (failed dependency or cancellation)
    StageSkipped {
        run: String,
        stage_name: String,
        status: StageStatus,
        reason: String,
    },

    ArtifactProduced {
        run: String,
        name: String,
        sha256: String,
        size: u64,
    },

    ArtifactUploaded {
        run: String,
        name: String,
        location: String,
    },

    Log {
        level: LogLevel,
        message: String,
        run: Option<String>,
        stage_name: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn pipeline_started(name: impl Into<String>, total_runs: usize) -> Self {
        Self::PipelineStarted {
            pipeline_name: name.into(),
            total_runs,
        }
    }

    pub fn pipeline_completed(name: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::PipelineCompleted {
            pipeline_name: name.into(),
            success,
            duration,
        }
    }

    pub fn pipeline_skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PipelineSkipped {
            pipeline_name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn run_started(
        run: impl Into<String>,
        artifact_name: impl Into<String>,
        total_stages: usize,
    ) -> Self {
        Self::RunStarted {
            run: run.into(),
            artifact_name: artifact_name.into(),
            total_stages,
        }
    }

    pub fn run_completed(run: impl Into<String>, status: RunStatus, duration: Duration) -> Self {
        Self::RunCompleted {
            run: run.into(),
            status,
            duration,
        }
    }

    pub fn stage_started(
        run: impl Into<String>,
        stage_name: impl Into<String>,
        display_name: Option<String>,
    ) -> Self {
        Self::StageStarted {
            run: run.into(),
            stage_name: stage_name.into(),
            display_name,
        }
    }

    pub fn stage_output(
        run: impl Into<String>,
        stage_name: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StageOutput {
            run: run.into(),
            stage_name: stage_name.into(),
            output: output.into(),
            is_error,
        }
    }

    pub fn stage_completed(
        run: impl Into<String>,
        stage_name: impl Into<String>,
        status: StageStatus,
        duration: Duration,
        exit_code: Option<i32>,
    ) -> Self {
        Self::StageCompleted {
            run: run.into(),
            stage_name: stage_name.into(),
            status,
            duration,
            exit_code,
        }
    }

    pub fn stage_skipped(
        run: impl Into<String>,
        stage_name: impl Into<String>,
        status: StageStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self::StageSkipped {
            run: run.into(),
            stage_name: stage_name.into(),
            status,
            reason: reason.into(),
        }
    }

    pub fn artifact_produced(
        run: impl Into<String>,
        name: impl Into<String>,
        sha256: impl Into<String>,
        size: u64,
    ) -> Self {
        Self::ArtifactProduced {
            run: run.into(),
            name: name.into(),
            sha256: sha256.into(),
            size,
        }
    }

    pub fn artifact_uploaded(
        run: impl Into<String>,
        name: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self::ArtifactUploaded {
            run: run.into(),
            name: name.into(),
            location: location.into(),
        }
    }

    pub fn info(message: impl Into<String>, run: Option<String>, stage_name: Option<String>) -> Self {
        Self::log(LogLevel::Info, message, run, stage_name)
    }

    pub fn warning(
        message: impl Into<String>,
        run: Option<String>,
        stage_name: Option<String>,
    ) -> Self {
        Self::log(LogLevel::Warning, message, run, stage_name)
    }

    pub fn error(message: impl Into<String>, run: Option<String>, stage_name: Option<String>) -> Self {
        Self::log(LogLevel::Error, message, run, stage_name)
    }

    fn log(
        level: LogLevel,
        message: impl Into<String>,
        run: Option<String>,
        stage_name: Option<String>,
    ) -> Self {
        Self::Log {
            level,
            message: message.into(),
            run,
            stage_name,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
