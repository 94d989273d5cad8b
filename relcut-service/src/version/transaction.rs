// Rewrite Transactions
// Backed-up, all-or-nothing file rewrites with byte-for-byte restore

use crate::error::{ConfigError, ServiceError, ServiceResult};
use crate::utils::walk_files;

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Marks a staging directory as owned by one invocation
pub const LOCK_FILE: &str = ".relcut.lock";

/// One staged file mutation
#[derive(Debug, Clone)]
pub struct RewriteTransaction {
    /// Path relative to the tree root
    pub relative: PathBuf,
    pub original: Vec<u8>,
    pub rewritten: Vec<u8>,
    pub replacements: usize,
    /// Indices of the rules that changed this file
    pub rules: Vec<usize>,
}

/// Progress of a batch commit that stopped on a failed write
#[derive(Debug)]
pub struct CommitFailure {
    pub written: Vec<PathBuf>,
    pub failed: PathBuf,
    pub error: io::Error,
    pub not_attempted: Vec<PathBuf>,
}

/// Transactions sharing one staging directory
#[derive(Debug)]
pub struct RewriteBatch {
    root: PathBuf,
    staging_dir: PathBuf,
    transactions: Vec<RewriteTransaction>,
}

impl RewriteBatch {
    pub fn new(root: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            staging_dir: staging_dir.into(),
            transactions: Vec::new(),
        }
    }

    pub fn push(&mut self, transaction: RewriteTransaction) {
        self.transactions.push(transaction);
    }

    pub fn transactions(&self) -> &[RewriteTransaction] {
        &self.transactions
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn backup_path(&self, relative: &Path) -> PathBuf {
        self.staging_dir.join(relative)
    }

    /// Write every backup, read it back and compare with the original bytes
    pub fn stage_backups(&self) -> io::Result<()> {
        for tx in &self.transactions {
            let backup = self.backup_path(&tx.relative);
            if let Some(parent) = backup.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(&backup)?;
            file.write_all(&tx.original)?;
            file.sync_all()?;

            if fs::read(&backup)? != tx.original {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("backup of '{}' does not read back intact", tx.relative.display()),
                ));
            }
        }
        Ok(())
    }

    /// Delete every backup this batch wrote
    pub fn discard_backups(&self) -> io::Result<()> {
        for tx in &self.transactions {
            let backup = self.backup_path(&tx.relative);
            match fs::remove_file(&backup) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        prune_empty_dirs(&self.staging_dir)
    }

    /// Write all targets in order, stopping at the first failure.
    /// Backups must already be staged; they are left untouched.
    pub fn write_all(&self) -> Result<Vec<PathBuf>, CommitFailure> {
        let mut written = Vec::with_capacity(self.transactions.len());

        for (i, tx) in self.transactions.iter().enumerate() {
            let target = self.root.join(&tx.relative);
            if let Err(error) = write_atomic(&target, &tx.rewritten) {
                return Err(CommitFailure {
                    written,
                    failed: tx.relative.clone(),
                    error,
                    not_attempted: self.transactions[i + 1..]
                        .iter()
                        .map(|t| t.relative.clone())
                        .collect(),
                });
            }
            written.push(tx.relative.clone());
        }

        Ok(written)
    }
}

/// Replace `target` through a temp file in the same directory, keeping its permissions
pub fn write_atomic(target: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::NamedTempFile::new_in(parent)?;
    staged.write_all(contents)?;
    staged.as_file().sync_all()?;

    if let Ok(metadata) = fs::metadata(target) {
        fs::set_permissions(staged.path(), metadata.permissions())?;
    }

    staged.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Exclusive claim on a staging directory, released on drop
#[derive(Debug)]
pub struct StagingLock {
    dir: PathBuf,
}

impl StagingLock {
    pub fn acquire(dir: &Path) -> ServiceResult<Self> {
        fs::create_dir_all(dir).map_err(|e| ServiceError::io(dir, e))?;
        let lock = dir.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&lock) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self {
                    dir: dir.to_path_buf(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(ConfigError::StagingBusy {
                    path: dir.to_path_buf(),
                }
                .into())
            }
            Err(e) => Err(ServiceError::io(&lock, e)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Backups currently held in the staging directory
    pub fn backups(&self) -> io::Result<Vec<PathBuf>> {
        list_backups(&self.dir)
    }
}

impl Drop for StagingLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.dir.join(LOCK_FILE));
        // Only succeeds when nothing else is left behind
        let _ = fs::remove_dir(&self.dir);
    }
}

/// Relative paths of every backup under a staging directory
pub fn list_backups(staging_dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !staging_dir.is_dir() {
        return Ok(Vec::new());
    }
    Ok(walk_files(staging_dir, &[])?
        .into_iter()
        .filter(|p| p != Path::new(LOCK_FILE))
        .collect())
}

/// Outcome of restoring backups onto a tree
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RestoreReport {
    pub restored: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl RestoreReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Copy every backup in `staging_dir` back onto `root`; restored backups are removed
pub fn restore(root: &Path, staging_dir: &Path) -> ServiceResult<RestoreReport> {
    let lock = StagingLock::acquire(staging_dir)?;
    let backups = lock
        .backups()
        .map_err(|e| ServiceError::io(staging_dir, e))?;

    let mut report = RestoreReport::default();
    for relative in backups {
        let backup = staging_dir.join(&relative);
        let restored = fs::read(&backup)
            .and_then(|bytes| write_atomic(&root.join(&relative), &bytes))
            .and_then(|_| fs::remove_file(&backup));

        match restored {
            Ok(()) => {
                tracing::info!(path = %relative.display(), "restored from backup");
                report.restored.push(relative);
            }
            Err(e) => {
                tracing::error!(path = %relative.display(), error = %e, "restore failed");
                report.failed.push((relative, e.to_string()));
            }
        }
    }

    prune_empty_dirs(staging_dir).map_err(|e| ServiceError::io(staging_dir, e))?;
    Ok(report)
}

/// Remove empty directories below `dir` (not `dir` itself)
fn prune_empty_dirs(dir: &Path) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && !path.is_symlink() {
            prune_empty_dirs(&path)?;
            if fs::read_dir(&path)?.next().is_none() {
                fs::remove_dir(&path)?;
            }
        }
    }
    Ok(())
}
