// Artifact Sink
// Upload target for finished artifacts

use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("artifact name '{0}' is not a plain file name")]
    InvalidName(String),

    #[error("failed to store '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("upload of '{name}' rejected: {message}")]
    Rejected { name: String, message: String },
}

/// Acknowledgement returned by a sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkAck {
    /// Where the artifact can be retrieved from
    pub location: String,
}

#[async_trait::async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Store `bytes` under `name`. Re-uploading a name overwrites it.
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<SinkAck, SinkError>;
}

/// Stores artifacts as files in a directory (temp file + rename)
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn store(dir: PathBuf, name: String, bytes: Vec<u8>) -> Result<SinkAck, SinkError> {
        let io_err = |path: &PathBuf| {
            let path = path.clone();
            move |source: std::io::Error| SinkError::Io { path, source }
        };

        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let target = dir.join(&name);

        let mut staged = tempfile::NamedTempFile::new_in(&dir).map_err(io_err(&dir))?;
        staged.write_all(&bytes).map_err(io_err(&target))?;
        staged.as_file().sync_all().map_err(io_err(&target))?;
        staged.persist(&target).map_err(|e| SinkError::Io {
            path: target.clone(),
            source: e.error,
        })?;

        Ok(SinkAck {
            location: target.display().to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ArtifactSink for DirectorySink {
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<SinkAck, SinkError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(SinkError::InvalidName(name.to_string()));
        }

        let dir = self.dir.clone();
        let name = name.to_string();
        let target = self.dir.join(&name);
        tokio::task::spawn_blocking(move || Self::store(dir, name, bytes))
            .await
            .map_err(|e| SinkError::Io {
                path: target,
                source: std::io::Error::other(e.to_string()),
            })?
    }
}
