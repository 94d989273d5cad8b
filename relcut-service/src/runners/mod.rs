// Runners Module
// Stage command execution, asset fetching and artifact packaging

pub mod assets;
pub mod package;
pub mod retry;
pub mod shell;

pub use assets::{AssetError, AssetFetcher, AssetSource, UrlAssetSource};
pub use package::{PackageError, Packager};
pub use retry::{retry_delay, with_retry};
pub use shell::ShellRunner;

use crate::execution::events::ProgressSender;
use crate::execution::matrix::Combination;

use std::collections::HashMap;
use std::path::PathBuf;

/// Everything a runner needs to execute one stage command
#[derive(Debug, Clone)]
pub struct StageInvocation {
    /// Run label (combination name)
    pub run: String,
    pub stage_name: String,
    /// Macro-expanded command
    pub command: String,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub combination: Combination,
    /// Receives output lines as they are produced
    pub progress: Option<ProgressSender>,
}

/// Result of executing a stage command
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl StageOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Default::default()
        }
    }

    /// The process could not be started or was killed by a signal
    pub fn failed_to_run(message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: message.into(),
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes opaque stage commands.
/// Implementations must stop the underlying work when the returned future is dropped.
#[async_trait::async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, invocation: &StageInvocation) -> StageOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_success() {
        assert!(StageOutcome::exited(0).success());
        assert!(!StageOutcome::exited(1).success());
        assert!(!StageOutcome::failed_to_run("spawn failed").success());
    }
}
