// Propagation Engine
// Scans the tree, plans every rewrite, then commits them as one batch

use crate::error::{ConfigError, ServiceError, ServiceResult};
use crate::parser::models::VersionRule;
use crate::utils::walk_files;
use crate::version::report::{FileReport, FileStatus, RewriteOutcome, RewriteReport};
use crate::version::rules::{compile_rules, find_overlap, CompiledRule};
use crate::version::transaction::{RewriteBatch, RewriteTransaction, StagingLock};

use std::path::{Path, PathBuf};

/// Default staging directory name under the tree root
pub const DEFAULT_STAGING: &str = ".relcut-staging";

/// Every rewrite for one old -> new pair, computed before anything is written
#[derive(Debug)]
pub struct RewritePlan {
    pub batch: RewriteBatch,
    pub warnings: Vec<String>,
}

/// Rewrites version strings across a source tree
#[derive(Debug, Clone)]
pub struct Propagator {
    root: PathBuf,
    staging_dir: PathBuf,
    dry_run: bool,
    strict: bool,
}

impl Propagator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            staging_dir: root.join(DEFAULT_STAGING),
            root,
            dry_run: false,
            strict: false,
        }
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Treat overlapping rules as a configuration error instead of a warning
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Compute the rewrite of every matching file without touching the tree
    pub fn plan(&self, old: &str, new: &str, rules: &[VersionRule]) -> ServiceResult<RewritePlan> {
        let rules = compile_rules(rules, old, new)?;
        let skip = [PathBuf::from(".git"), self.staging_dir.clone()];
        let files = walk_files(&self.root, &skip).map_err(|e| ServiceError::io(&self.root, e))?;

        let mut batch = RewriteBatch::new(&self.root, &self.staging_dir);
        let mut warnings = Vec::new();

        for relative in files {
            let applicable: Vec<&CompiledRule> =
                rules.iter().filter(|r| r.applies_to(&relative)).collect();
            if applicable.is_empty() {
                continue;
            }

            let path = self.root.join(&relative);
            let original = std::fs::read(&path).map_err(|e| ServiceError::io(&path, e))?;

            let ranges: Vec<_> = applicable
                .iter()
                .map(|r| (r.index, r.ranges(&original)))
                .filter(|(_, found)| !found.is_empty())
                .collect();
            if let Some((first, second)) = find_overlap(&ranges) {
                let error = ConfigError::OverlappingRules {
                    file: relative.clone(),
                    first,
                    second,
                };
                if self.strict {
                    return Err(error.into());
                }
                tracing::warn!(path = %relative.display(), first, second, "overlapping version rules");
                warnings.push(error.to_string());
            }

            let mut contents = original.clone();
            let mut replacements = 0;
            let mut matched = Vec::new();
            for rule in &applicable {
                let (rewritten, count) = rule.apply(&contents);
                if count > 0 {
                    contents = rewritten.into_owned();
                    replacements += count;
                    matched.push(rule.index);
                }
            }

            if let Some(rule) = applicable.iter().find(|r| r.is_match(&contents)) {
                return Err(rule.non_idempotent().into());
            }

            if replacements > 0 && contents != original {
                tracing::debug!(path = %relative.display(), replacements, "rewrite planned");
                batch.push(RewriteTransaction {
                    relative,
                    original,
                    rewritten: contents,
                    replacements,
                    rules: matched,
                });
            }
        }

        Ok(RewritePlan { batch, warnings })
    }

    /// Rewrite `old` to `new` across the tree.
    ///
    /// Backups of every target are staged before the first write and deleted
    /// only after the last write succeeds. A failed write stops the batch and
    /// leaves all backups for `restore`.
    pub fn propagate(
        &self,
        old: &str,
        new: &str,
        rules: &[VersionRule],
    ) -> ServiceResult<RewriteReport> {
        let lock = StagingLock::acquire(&self.staging_dir)?;
        let pending = lock
            .backups()
            .map_err(|e| ServiceError::io(&self.staging_dir, e))?;
        if !pending.is_empty() {
            return Err(ConfigError::PendingBackups {
                path: self.staging_dir.clone(),
            }
            .into());
        }

        let plan = self.plan(old, new, rules)?;
        self.commit(old, new, plan)
    }

    /// Apply a plan. The caller owns the staging directory.
    pub fn commit(&self, old: &str, new: &str, plan: RewritePlan) -> ServiceResult<RewriteReport> {
        let RewritePlan { batch, warnings } = plan;
        let mut report = RewriteReport {
            old_version: old.to_string(),
            new_version: new.to_string(),
            outcome: RewriteOutcome::NoChanges,
            files: Vec::new(),
            warnings,
            backups: None,
        };

        if batch.is_empty() {
            tracing::info!(old, new, "no occurrences found; tree already propagated");
            return Ok(report);
        }

        batch
            .stage_backups()
            .map_err(|e| ServiceError::io(&self.staging_dir, e))?;

        if self.dry_run {
            batch
                .discard_backups()
                .map_err(|e| ServiceError::io(&self.staging_dir, e))?;
            report.outcome = RewriteOutcome::DryRun;
            report.files = file_reports(&batch, FileStatus::Planned);
            tracing::info!(files = report.files.len(), "dry run complete");
            return Ok(report);
        }

        match batch.write_all() {
            Ok(_) => {
                batch
                    .discard_backups()
                    .map_err(|e| ServiceError::io(&self.staging_dir, e))?;
                report.outcome = RewriteOutcome::Complete;
                report.files = file_reports(&batch, FileStatus::Rewritten);
                tracing::info!(old, new, files = report.files.len(), "version propagated");
            }
            Err(failure) => {
                tracing::error!(
                    path = %failure.failed.display(),
                    error = %failure.error,
                    "write failed; backups kept"
                );
                let mut files = file_reports(&batch, FileStatus::Rewritten);
                for file in &mut files {
                    if file.path == failure.failed {
                        file.status = FileStatus::Failed;
                        file.error = Some(failure.error.to_string());
                    } else if failure.not_attempted.contains(&file.path) {
                        file.status = FileStatus::NotAttempted;
                    }
                }
                report.outcome = RewriteOutcome::PartialFailure;
                report.files = files;
                report.backups = Some(self.staging_dir.clone());
            }
        }

        Ok(report)
    }
}

fn file_reports(batch: &RewriteBatch, status: FileStatus) -> Vec<FileReport> {
    batch
        .transactions()
        .iter()
        .map(|tx| FileReport {
            path: tx.relative.clone(),
            status,
            replacements: tx.replacements,
            rules: tx.rules.clone(),
            error: None,
        })
        .collect()
}
