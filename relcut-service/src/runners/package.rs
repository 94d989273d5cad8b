// Packager
// Strips auxiliary libraries, renames the bundle and compresses it into the run artifact

use crate::execution::context::RunContext;
use crate::parser::models::{Artifact, PackageSpec};
use crate::utils::{compile_globs, matching_entries};

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("package source '{}' does not exist", path.display())]
    MissingSource { path: PathBuf },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid strip pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PackageError + '_ {
    move |source| PackageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Builds artifacts. All methods block; call them from `spawn_blocking`.
pub struct Packager;

impl Packager {
    /// Run a `package` stage: strip, rename to the artifact name, write `<output>/<name>.tar.gz`
    pub fn package(spec: &PackageSpec, ctx: &RunContext) -> Result<Artifact, PackageError> {
        let source = ctx.resolve_path(&spec.source);
        if !source.exists() {
            return Err(PackageError::MissingSource { path: source });
        }

        let stripped = if source.is_dir() {
            Self::strip(&source, &spec.strip)?
        } else {
            Vec::new()
        };
        for path in &stripped {
            tracing::debug!(path = %path.display(), "stripped from bundle");
        }

        let bundle = Self::rename_bundle(&source, &ctx.artifact_name)?;
        let file_name = format!("{}.tar.gz", ctx.artifact_name);
        let output = ctx.output_dir.join(&file_name);

        std::fs::create_dir_all(&ctx.output_dir).map_err(io_err(&ctx.output_dir))?;
        let mut staged =
            tempfile::NamedTempFile::new_in(&ctx.output_dir).map_err(io_err(&ctx.output_dir))?;
        {
            let encoder = GzEncoder::new(staged.as_file_mut(), Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.follow_symlinks(false);
            if bundle.is_dir() {
                builder
                    .append_dir_all(&ctx.artifact_name, &bundle)
                    .map_err(io_err(&bundle))?;
            } else {
                let name = bundle
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(&ctx.artifact_name));
                builder
                    .append_path_with_name(&bundle, Path::new(&ctx.artifact_name).join(name))
                    .map_err(io_err(&bundle))?;
            }
            let encoder = builder.into_inner().map_err(io_err(&output))?;
            encoder.finish().map_err(io_err(&output))?;
        }
        staged
            .persist(&output)
            .map_err(|e| PackageError::Io {
                path: output.clone(),
                source: e.error,
            })?;

        Self::describe(&output, &file_name)
    }

    /// Collect a file emitted by a `run` stage as `<output>/<artifact name><extension>`
    pub fn collect(produced: &Path, ctx: &RunContext) -> Result<Artifact, PackageError> {
        if !produced.is_file() {
            return Err(PackageError::MissingSource {
                path: produced.to_path_buf(),
            });
        }

        let file_name = format!("{}{}", ctx.artifact_name, extension_of(produced));
        let output = ctx.output_dir.join(&file_name);
        std::fs::create_dir_all(&ctx.output_dir).map_err(io_err(&ctx.output_dir))?;

        let staged =
            tempfile::NamedTempFile::new_in(&ctx.output_dir).map_err(io_err(&ctx.output_dir))?;
        std::fs::copy(produced, staged.path()).map_err(io_err(produced))?;
        staged.persist(&output).map_err(|e| PackageError::Io {
            path: output.clone(),
            source: e.error,
        })?;

        Self::describe(&output, &file_name)
    }

    /// Remove entries matching the strip list; returns what was removed
    pub fn strip(bundle: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, PackageError> {
        let globs = compile_globs(patterns).map_err(|(pattern, e)| PackageError::Pattern {
            pattern,
            message: e.to_string(),
        })?;
        if globs.is_empty() {
            return Ok(Vec::new());
        }

        let matched = matching_entries(bundle, &globs).map_err(io_err(bundle))?;
        for relative in &matched {
            let path = bundle.join(relative);
            if path.is_dir() {
                std::fs::remove_dir_all(&path).map_err(io_err(&path))?;
            } else {
                std::fs::remove_file(&path).map_err(io_err(&path))?;
            }
        }
        Ok(matched)
    }

    /// Rename a directory bundle to `name` in place; files keep their name
    fn rename_bundle(source: &Path, name: &str) -> Result<PathBuf, PackageError> {
        if !source.is_dir() || source.file_name().map(|n| n == name).unwrap_or(false) {
            return Ok(source.to_path_buf());
        }

        let parent = source.parent().unwrap_or_else(|| Path::new("."));
        let target = parent.join(name);
        if target.exists() {
            std::fs::remove_dir_all(&target).map_err(io_err(&target))?;
        }
        std::fs::rename(source, &target).map_err(io_err(source))?;
        Ok(target)
    }

    fn describe(path: &Path, name: &str) -> Result<Artifact, PackageError> {
        let (sha256, size) = sha256_file(path)?;
        Ok(Artifact {
            name: name.to_string(),
            path: path.to_path_buf(),
            sha256,
            size,
        })
    }
}

/// Hex SHA-256 and size of a file
pub fn sha256_file(path: &Path) -> Result<(String, u64), PackageError> {
    let mut file = std::fs::File::open(path).map_err(io_err(path))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(io_err(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Extension including compound archive suffixes (.tar.gz, .tar.xz)
fn extension_of(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for compound in [".tar.gz", ".tar.xz", ".tar.bz2", ".tar.zst"] {
        if name.ends_with(compound) {
            return compound.to_string();
        }
    }
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::matrix::Combination;
    use crate::parser::models::{PipelineSpec, TriggerEvent};
    use flate2::read::GzDecoder;

    fn context(staging: &Path) -> RunContext {
        let spec = PipelineSpec {
            name: "app".to_string(),
            product: Some("whisper".to_string()),
            artifact_name: "$(Pipeline.Product)_$(Matrix.Name)".to_string(),
            ..Default::default()
        };
        RunContext::new(
            &spec,
            Combination::new(0, [("os", "linux"), ("arch", "x86_64")]),
            &TriggerEvent::manual("main"),
            staging.join("work"),
            staging.join("out"),
        )
    }

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn entry_names(archive: &Path) -> Vec<String> {
        let file = std::fs::File::open(archive).unwrap();
        let mut tarball = tar::Archive::new(GzDecoder::new(file));
        let mut names: Vec<String> = tarball
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_package_strips_renames_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let bundle = ctx.staging_dir.join("build/bundle");
        write(&bundle.join("app"), "binary");
        write(&bundle.join("lib/libwhisper.so"), "lib");
        write(&bundle.join("lib/libvulkan.so.1"), "aux");

        let spec = PackageSpec {
            source: "build/bundle".to_string(),
            strip: vec!["libvulkan.so*".to_string()],
        };
        let artifact = Packager::package(&spec, &ctx).unwrap();

        assert_eq!(artifact.name, "whisper_linux_x86_64.tar.gz");
        assert_eq!(artifact.path, dir.path().join("out/whisper_linux_x86_64.tar.gz"));
        assert_eq!(artifact.sha256.len(), 64);
        assert_eq!(artifact.size, std::fs::metadata(&artifact.path).unwrap().len());
        assert!(ctx.staging_dir.join("build/whisper_linux_x86_64").is_dir());

        let names = entry_names(&artifact.path);
        assert!(names.contains(&"whisper_linux_x86_64/app".to_string()));
        assert!(names.contains(&"whisper_linux_x86_64/lib/libwhisper.so".to_string()));
        assert!(!names.iter().any(|n| n.contains("libvulkan")));
    }

    #[test]
    fn test_package_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let spec = PackageSpec {
            source: "nope".to_string(),
            strip: Vec::new(),
        };
        let err = Packager::package(&spec, &context(dir.path())).unwrap_err();
        assert!(matches!(err, PackageError::MissingSource { .. }));
    }

    #[test]
    fn test_collect_keeps_compound_extension() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let produced = ctx.staging_dir.join("dist/bundle.tar.gz");
        write(&produced, "payload");

        let artifact = Packager::collect(&produced, &ctx).unwrap();
        assert_eq!(artifact.name, "whisper_linux_x86_64.tar.gz");
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"payload");
    }

    #[test]
    fn test_sha256_file_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, "abc").unwrap();

        let (digest, size) = sha256_file(&path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(size, 3);
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of(Path::new("a/b.tar.gz")), ".tar.gz");
        assert_eq!(extension_of(Path::new("app.dmg")), ".dmg");
        assert_eq!(extension_of(Path::new("noext")), "");
    }
}
