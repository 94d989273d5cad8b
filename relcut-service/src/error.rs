// Service Errors
// Top-level error type for the engine and configuration errors for version rules

use crate::execution::graph::GraphError;
use crate::parser::error::{ParseError, ValidationError};

use std::path::PathBuf;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("pipeline is invalid:\n{}", format_validation(.0))]
    Validation(Vec<ValidationError>),

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ServiceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this is a configuration problem detected before anything ran
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ServiceError::Parse(_)
                | ServiceError::Graph(_)
                | ServiceError::Config(_)
                | ServiceError::Validation(_)
        )
    }
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Version rule problems, all fatal before any file is touched
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("version strings must not be empty")]
    EmptyVersion,

    #[error("old and new version are both '{0}'")]
    SameVersion(String),

    #[error("invalid glob '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },

    #[error("invalid match pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("rule for '{glob}' does not anchor on the old version (match '{pattern}' must contain {{old}} or the old version)")]
    UnanchoredRule { glob: String, pattern: String },

    #[error("rule for '{glob}' does not write the new version (replacement '{replacement}')")]
    MissingNewVersion { glob: String, replacement: String },

    #[error("rule for '{glob}' is not idempotent: its replacement '{replacement}' matches the rule again")]
    NonIdempotentRule { glob: String, replacement: String },

    #[error("rules {first} and {second} rewrite overlapping text in '{}'", file.display())]
    OverlappingRules {
        file: PathBuf,
        first: usize,
        second: usize,
    },

    #[error("staging directory '{}' is in use by another invocation", path.display())]
    StagingBusy { path: PathBuf },

    #[error("staging directory '{}' holds backups from an earlier run; restore or remove them first", path.display())]
    PendingBackups { path: PathBuf },
}
