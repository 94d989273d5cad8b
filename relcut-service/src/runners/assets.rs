// Asset Fetcher
// Downloads remote assets into a run's staging directory, unpacks archives and prunes

use super::retry::with_retry;
use crate::execution::context::RunContext;
use crate::parser::models::FetchSpec;
use crate::utils::{compile_globs, matching_entries};

use flate2::read::GzDecoder;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("unsupported asset url '{0}' (expected http://, https:// or file://)")]
    UnsupportedUrl(String),

    #[error("request for '{url}' failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("'{url}' returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive entry '{entry}' escapes the destination directory")]
    PathEscape { entry: String },

    #[error("failed to extract '{}': {source}", archive.display())]
    Extract {
        archive: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid prune pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
}

impl AssetError {
    /// Failures a later attempt can plausibly get past: connection trouble,
    /// server errors, throttling and request timeouts
    pub fn is_transient(&self) -> bool {
        match self {
            AssetError::Http { source, .. } => !source.is_builder(),
            AssetError::Status { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            _ => false,
        }
    }
}

/// Where asset bytes come from
#[async_trait::async_trait]
pub trait AssetSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, AssetError>;
}

/// Fetches http(s):// with reqwest and file:// from the local disk
pub struct UrlAssetSource {
    client: reqwest::Client,
}

impl UrlAssetSource {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("relcut/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for UrlAssetSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AssetSource for UrlAssetSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, AssetError> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read(path).await.map_err(|source| AssetError::Read {
                path: PathBuf::from(path),
                source,
            });
        }

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AssetError::UnsupportedUrl(url.to_string()));
        }

        let http_err = |source| AssetError::Http {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(http_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AssetError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(http_err)?;
        Ok(bytes.to_vec())
    }
}

/// What a fetch stage did
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    /// Files written to the destination (archives excluded once extracted)
    pub downloaded: Vec<PathBuf>,
    /// Number of archive entries unpacked
    pub extracted: usize,
    /// Entries removed by the prune list, relative to the destination
    pub pruned: Vec<PathBuf>,
}

impl FetchReport {
    pub fn summary(&self) -> String {
        format!(
            "downloaded {} asset(s), extracted {} entr{}, pruned {} path(s)",
            self.downloaded.len(),
            self.extracted,
            if self.extracted == 1 { "y" } else { "ies" },
            self.pruned.len()
        )
    }
}

/// Executes `fetch` stages
#[derive(Clone)]
pub struct AssetFetcher {
    source: Arc<dyn AssetSource>,
}

impl AssetFetcher {
    pub fn new(source: Arc<dyn AssetSource>) -> Self {
        Self { source }
    }

    /// Download every asset (with retry), unpack archives, then apply the prune list
    pub async fn fetch(&self, spec: &FetchSpec, ctx: &RunContext) -> Result<FetchReport, AssetError> {
        let destination = match &spec.destination {
            Some(dir) => ctx.resolve_path(dir),
            None => ctx.staging_dir.clone(),
        };
        tokio::fs::create_dir_all(&destination)
            .await
            .map_err(|source| AssetError::Write {
                path: destination.clone(),
                source,
            })?;

        let prune = compile_globs(&spec.prune).map_err(|(pattern, e)| AssetError::Pattern {
            pattern,
            message: e.to_string(),
        })?;

        let mut report = FetchReport::default();

        for asset in &spec.assets {
            let url = ctx.substitute(&asset.url);
            let file_name = match &asset.file_name {
                Some(name) => ctx.substitute(name),
                None => file_name_from_url(&url)
                    .ok_or_else(|| AssetError::UnsupportedUrl(url.clone()))?,
            };
            if !is_plain_file_name(&file_name) {
                return Err(AssetError::PathEscape { entry: file_name });
            }

            let source = self.source.clone();
            let bytes = with_retry(&spec.retry, &url, AssetError::is_transient, |attempt| {
                let source = source.clone();
                let url = url.clone();
                async move {
                    tracing::debug!(%url, attempt, "downloading asset");
                    source.fetch(&url).await
                }
            })
            .await?;

            let target = destination.join(&file_name);
            tokio::fs::write(&target, &bytes)
                .await
                .map_err(|source| AssetError::Write {
                    path: target.clone(),
                    source,
                })?;
            tracing::info!(%url, path = %target.display(), bytes = bytes.len(), "asset downloaded");

            if asset.extract && is_tar_gz(&file_name) {
                let archive = target.clone();
                let dest = destination.clone();
                let count = tokio::task::spawn_blocking(move || extract_tar_gz(&archive, &dest))
                    .await
                    .map_err(|e| AssetError::Extract {
                        archive: target.clone(),
                        source: std::io::Error::other(e.to_string()),
                    })??;
                report.extracted += count;
                tokio::fs::remove_file(&target)
                    .await
                    .map_err(|source| AssetError::Write {
                        path: target.clone(),
                        source,
                    })?;
            } else {
                report.downloaded.push(target);
            }
        }

        if !prune.is_empty() {
            let matched = matching_entries(&destination, &prune).map_err(|source| AssetError::Read {
                path: destination.clone(),
                source,
            })?;
            for relative in matched {
                let path = destination.join(&relative);
                let removed = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                removed.map_err(|source| AssetError::Write {
                    path: path.clone(),
                    source,
                })?;
                report.downloaded.retain(|p| !p.starts_with(&path));
                report.pruned.push(relative);
            }
        }

        Ok(report)
    }
}

/// Last path segment of a URL without query or fragment
pub fn file_name_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query.rsplit('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn is_tar_gz(name: &str) -> bool {
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Unpack a gzip'd tarball, rejecting entries that would land outside `dest`
pub fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<usize, AssetError> {
    let extract_err = |source| AssetError::Extract {
        archive: archive.to_path_buf(),
        source,
    };

    let file = std::fs::File::open(archive).map_err(|source| AssetError::Read {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut tarball = tar::Archive::new(GzDecoder::new(file));

    let mut count = 0;
    for entry in tarball.entries().map_err(extract_err)? {
        let mut entry = entry.map_err(extract_err)?;
        let path = entry.path().map_err(extract_err)?.into_owned();

        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
        if escapes {
            return Err(AssetError::PathEscape {
                entry: path.display().to_string(),
            });
        }

        let unpacked = entry.unpack_in(dest).map_err(extract_err)?;
        if !unpacked {
            return Err(AssetError::PathEscape {
                entry: path.display().to_string(),
            });
        }
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::matrix::Combination;
    use crate::parser::models::{AssetSpec, PipelineSpec, RetryPolicy, TriggerEvent};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves fixed bytes per URL, failing the first `failures` requests
    struct ScriptedSource {
        files: HashMap<String, Vec<u8>>,
        failures: u32,
        calls: AtomicU32,
    }

    impl ScriptedSource {
        fn new(files: &[(&str, Vec<u8>)], failures: u32) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl AssetSource for ScriptedSource {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, AssetError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(AssetError::Status {
                    url: url.to_string(),
                    status: 503,
                });
            }
            self.files.get(url).cloned().ok_or(AssetError::Status {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    fn context(staging: &Path) -> RunContext {
        let spec = PipelineSpec {
            name: "app".to_string(),
            ..Default::default()
        };
        RunContext::new(
            &spec,
            Combination::new(0, [("arch", "arm64")]),
            &TriggerEvent::manual("main"),
            staging.to_path_buf(),
            staging.join("out"),
        )
    }

    fn tarball(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn asset(url: &str, extract: bool) -> AssetSpec {
        AssetSpec {
            url: url.to_string(),
            file_name: None,
            extract,
        }
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://host/models/ggml-base.bin?download=true"),
            Some("ggml-base.bin".to_string())
        );
        assert_eq!(file_name_from_url("https://host/dir/"), None);
    }

    #[tokio::test]
    async fn test_fetch_extract_and_prune() {
        let staging = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(
            &[
                (
                    "https://assets/models-arm64.tar.gz",
                    tarball(&[
                        ("models/base.onnx", "full"),
                        ("models/base.int8.onnx", "quantized"),
                    ]),
                ),
                ("https://assets/vocab.txt", b"a b c".to_vec()),
            ],
            0,
        );
        let spec = FetchSpec {
            assets: vec![
                asset("https://assets/models-$(arch).tar.gz", true),
                asset("https://assets/vocab.txt", false),
            ],
            destination: Some("assets".to_string()),
            prune: vec!["*.int8.onnx".to_string()],
            retry: RetryPolicy::none(),
        };

        let fetcher = AssetFetcher::new(Arc::new(source));
        let report = fetcher.fetch(&spec, &context(staging.path())).await.unwrap();

        let dest = staging.path().join("assets");
        assert!(dest.join("models/base.onnx").exists());
        assert!(!dest.join("models/base.int8.onnx").exists());
        assert!(!dest.join("models-arm64.tar.gz").exists());
        assert!(dest.join("vocab.txt").exists());
        assert_eq!(report.extracted, 2);
        assert_eq!(report.pruned, vec![PathBuf::from("models/base.int8.onnx")]);
        assert_eq!(report.downloaded, vec![dest.join("vocab.txt")]);
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_failures() {
        let staging = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(
            &[("https://assets/model.bin", b"weights".to_vec())],
            2,
        ));
        let spec = FetchSpec {
            assets: vec![asset("https://assets/model.bin", false)],
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_ms: 1,
                max_backoff_ms: 10,
            },
            ..Default::default()
        };

        let fetcher = AssetFetcher::new(source.clone());
        fetcher.fetch(&spec, &context(staging.path())).await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            std::fs::read(staging.path().join("model.bin")).unwrap(),
            b"weights"
        );
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_max_attempts() {
        let staging = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(&[], 10));
        let spec = FetchSpec {
            assets: vec![asset("https://assets/model.bin", false)],
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_ms: 1,
                max_backoff_ms: 10,
            },
            ..Default::default()
        };

        let err = AssetFetcher::new(source.clone())
            .fetch(&spec, &context(staging.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, AssetError::Status { status: 503, .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_asset_is_not_retried() {
        let staging = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(&[], 0));
        let spec = FetchSpec {
            assets: vec![asset("https://assets/missing.bin", false)],
            retry: RetryPolicy {
                max_attempts: 5,
                backoff_ms: 1,
                max_backoff_ms: 10,
            },
            ..Default::default()
        };

        let err = AssetFetcher::new(source.clone())
            .fetch(&spec, &context(staging.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, AssetError::Status { status: 404, .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transient_errors() {
        let status = |status| AssetError::Status {
            url: "https://assets/x".to_string(),
            status,
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!AssetError::UnsupportedUrl("ftp://x".to_string()).is_transient());
        assert!(!AssetError::PathEscape {
            entry: "../x".to_string()
        }
        .is_transient());
    }

    #[tokio::test]
    async fn test_file_url_source() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("asset.bin");
        std::fs::write(&file, b"local").unwrap();

        let bytes = UrlAssetSource::new()
            .fetch(&format!("file://{}", file.display()))
            .await
            .unwrap();
        assert_eq!(bytes, b"local");

        let err = UrlAssetSource::new().fetch("ftp://host/x").await.unwrap_err();
        assert!(matches!(err, AssetError::UnsupportedUrl(_)));
    }

    #[test]
    fn test_extract_rejects_escaping_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.tar.gz");

        // tar::Builder refuses '..' paths, so write the name into the header directly
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        {
            let name = b"../escape.txt";
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..name.len()].copy_from_slice(name);
        }
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &b"evil"[..]).unwrap();
        std::fs::write(&archive, builder.into_inner().unwrap().finish().unwrap()).unwrap();

        let dest = dir.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        let err = extract_tar_gz(&archive, &dest).unwrap_err();

        assert!(matches!(err, AssetError::PathEscape { .. }));
        assert!(!dir.path().join("escape.txt").exists());
    }
}
