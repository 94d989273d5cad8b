// Utility Functions
// Repository root detection, default directories and glob-based tree walking

use glob::{MatchOptions, Pattern, PatternError};
use std::fs::FileType;
use std::io;
use std::path::{Path, PathBuf};

/// Find the root of a git repository by walking up from the given starting path.
///
/// Returns `None` if no ancestor contains a `.git` entry.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    for ancestor in start.ancestors() {
        if ancestor.join(".git").exists() {
            return Some(ancestor.to_path_buf());
        }
    }
    None
}

/// Repository root of the current directory, falling back to the current directory
pub fn resolve_working_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_repo_root(&cwd).unwrap_or(cwd)
}

/// Base directory for relcut state (`<cache dir>/relcut`)
pub fn data_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("relcut")
}

/// Render a relative path with '/' separators for glob matching
pub fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// A glob over a tree. Globs without '/' match the file name at any depth;
/// globs containing '/' match the whole relative path.
#[derive(Debug, Clone)]
pub struct PathGlob {
    raw: String,
    pattern: Pattern,
    name_only: bool,
}

impl PathGlob {
    pub fn new(raw: &str) -> Result<Self, PatternError> {
        Ok(Self {
            raw: raw.to_string(),
            pattern: Pattern::new(raw)?,
            name_only: !raw.contains('/'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a path relative to the tree root
    pub fn matches(&self, relative: &Path) -> bool {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        if self.name_only {
            relative
                .file_name()
                .map(|name| self.pattern.matches_with(&name.to_string_lossy(), options))
                .unwrap_or(false)
        } else {
            self.pattern.matches_with(&slash_path(relative), options)
        }
    }
}

/// Compile a list of globs, reporting the first invalid one
pub fn compile_globs(raw: &[String]) -> Result<Vec<PathGlob>, (String, PatternError)> {
    raw.iter()
        .map(|g| PathGlob::new(g).map_err(|e| (g.clone(), e)))
        .collect()
}

/// All regular files under `root` as sorted relative paths.
/// Symlinks are neither followed nor reported; directories named in `skip`
/// (relative or absolute) are pruned.
pub fn walk_files(root: &Path, skip: &[PathBuf]) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    walk(root, Path::new(""), skip, &mut |rel, file_type| {
        if file_type.is_file() {
            files.push(rel.to_path_buf());
        }
        true
    })?;
    files.sort();
    Ok(files)
}

/// Top-most entries (files or directories) under `root` matching any glob, sorted.
/// Children of a matched directory are not reported separately.
pub fn matching_entries(root: &Path, globs: &[PathGlob]) -> io::Result<Vec<PathBuf>> {
    let mut matched = Vec::new();
    walk(root, Path::new(""), &[], &mut |rel, _file_type| {
        if globs.iter().any(|g| g.matches(rel)) {
            matched.push(rel.to_path_buf());
            false
        } else {
            true
        }
    })?;
    matched.sort();
    Ok(matched)
}

/// Depth-first walk in sorted order, never through symlinks.
/// The visitor returns false to skip a directory's children.
fn walk(
    root: &Path,
    relative: &Path,
    skip: &[PathBuf],
    visit: &mut dyn FnMut(&Path, &FileType) -> bool,
) -> io::Result<()> {
    let dir = root.join(relative);
    let mut entries: Vec<_> = std::fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let rel = relative.join(entry.file_name());
        let file_type = entry.file_type()?;
        let is_dir = file_type.is_dir();

        if is_dir && is_skipped(root, &rel, skip) {
            continue;
        }

        let descend = visit(&rel, &file_type);
        if is_dir && descend {
            walk(root, &rel, skip, visit)?;
        }
    }

    Ok(())
}

fn is_skipped(root: &Path, relative: &Path, skip: &[PathBuf]) -> bool {
    skip.iter().any(|s| {
        if s.is_absolute() {
            root.join(relative) == *s
        } else {
            relative == s.as_path()
        }
    })
}
