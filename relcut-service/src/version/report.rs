// Rewrite Report
// Machine-readable summary of a propagation run

use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteOutcome {
    /// Every file rewritten, backups deleted
    Complete,
    /// Nothing matched; the tree is already at the new version
    NoChanges,
    /// Some writes failed; backups kept for restore
    PartialFailure,
    /// Rewrites computed and backups verified, tree untouched
    DryRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Rewritten,
    Planned,
    Failed,
    NotAttempted,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub status: FileStatus,
    pub replacements: usize,
    /// Indices of the rules that matched
    pub rules: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewriteReport {
    pub old_version: String,
    pub new_version: String,
    pub outcome: RewriteOutcome,
    pub files: Vec<FileReport>,
    pub warnings: Vec<String>,
    /// Set when backups were left in the staging directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backups: Option<PathBuf>,
}

impl RewriteReport {
    pub fn is_success(&self) -> bool {
        self.outcome != RewriteOutcome::PartialFailure
    }

    pub fn with_status(&self, status: FileStatus) -> Vec<&FileReport> {
        self.files.iter().filter(|f| f.status == status).collect()
    }

    pub fn succeeded(&self) -> Vec<&FileReport> {
        self.with_status(FileStatus::Rewritten)
    }

    pub fn failed(&self) -> Vec<&FileReport> {
        self.with_status(FileStatus::Failed)
    }

    pub fn total_replacements(&self) -> usize {
        self.files.iter().map(|f| f.replacements).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_json() {
        let report = RewriteReport {
            old_version: "1.11.5".to_string(),
            new_version: "1.12.0".to_string(),
            outcome: RewriteOutcome::PartialFailure,
            files: vec![
                FileReport {
                    path: PathBuf::from("a.yaml"),
                    status: FileStatus::Rewritten,
                    replacements: 2,
                    rules: vec![0],
                    error: None,
                },
                FileReport {
                    path: PathBuf::from("b.yaml"),
                    status: FileStatus::Failed,
                    replacements: 1,
                    rules: vec![0],
                    error: Some("permission denied".to_string()),
                },
            ],
            warnings: Vec::new(),
            backups: Some(PathBuf::from(".relcut-staging")),
        };

        assert!(!report.is_success());
        assert_eq!(report.succeeded().len(), 1);
        assert_eq!(report.total_replacements(), 3);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["outcome"], "partial_failure");
        assert_eq!(json["files"][1]["status"], "failed");
        assert_eq!(json["files"][1]["error"], "permission denied");
        assert!(json["files"][0].get("error").is_none());
    }
}
