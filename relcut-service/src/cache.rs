// Build Cache
// Shared compilation cache directory exported to the external toolchain (best effort)

use crate::execution::context::{sanitize_name, RunContext};
use crate::parser::models::CacheSpec;
use crate::utils::data_dir;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Points the external compiler cache (ccache, sccache) at a shared directory.
/// Runs share slots without locking; the tool itself handles concurrent access.
#[derive(Debug, Clone)]
pub struct BuildCache {
    root: PathBuf,
}

impl BuildCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<cache dir>/relcut/build-cache`
    pub fn default_root() -> PathBuf {
        data_dir().join("build-cache")
    }

    /// Root from the pipeline, else the default
    pub fn from_spec(spec: &CacheSpec) -> Self {
        match &spec.dir {
            Some(dir) => Self::new(dir),
            None => Self::new(Self::default_root()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Slot directory for a run
    pub fn slot(&self, spec: &CacheSpec, ctx: &RunContext) -> PathBuf {
        self.root.join(sanitize_name(&ctx.substitute(&spec.key)))
    }

    /// Create the slot and return the env vars pointing at it.
    /// Failures are logged and yield no variables; a missing cache never fails a build.
    pub fn prepare(&self, spec: &CacheSpec, ctx: &RunContext) -> HashMap<String, String> {
        let slot = self.slot(spec, ctx);

        if let Err(e) = std::fs::create_dir_all(&slot) {
            tracing::warn!(
                path = %slot.display(),
                error = %e,
                "build cache unavailable, continuing without it"
            );
            return HashMap::new();
        }

        tracing::debug!(run = %ctx.run_label(), path = %slot.display(), "build cache ready");
        let value = slot.display().to_string();
        spec.env
            .iter()
            .map(|name| (name.clone(), value.clone()))
            .collect()
    }
}
