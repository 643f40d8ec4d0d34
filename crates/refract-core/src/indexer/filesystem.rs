//! Filesystem scanning helpers for indexing passes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::models::Technology;

pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    "dist",
    "build",
    ".git",
    ".aws",
    ".next",
    "__pycache__",
    "venv",
    ".venv",
    "env",
    ".env",
    "coverage",
    ".coverage",
    "tmp",
    ".tmp",
    ".idea",
    ".vscode",
    ".refract",
];

pub const DEFAULT_EXCLUDED_SUFFIXES: &[&str] = &[
    ".pyc",
    ".pyo",
    ".pyd",
    ".so",
    ".dll",
    ".dylib",
    ".log",
    ".DS_Store",
    ".env",
    ".coverage",
    ".pytest_cache",
];

/// Which files an indexing pass considers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Allowed extensions without the dot. Empty means every recognized technology.
    pub extensions: Vec<String>,
    /// Gitignore-style patterns evaluated relative to each walked root.
    pub exclude_patterns: Vec<String>,
    pub excluded_dirs: Vec<String>,
    pub excluded_suffixes: Vec<String>,
    pub respect_gitignore: bool,
    pub follow_symlinks: bool,
    pub max_file_size_bytes: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            exclude_patterns: Vec::new(),
            excluded_dirs: DEFAULT_EXCLUDED_DIRS.iter().map(|s| s.to_string()).collect(),
            excluded_suffixes: DEFAULT_EXCLUDED_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            respect_gitignore: true,
            follow_symlinks: false,
            max_file_size_bytes: 2 * 1024 * 1024,
        }
    }
}

impl FilterConfig {
    fn dir_excluded(&self, name: &str) -> bool {
        self.excluded_dirs.iter().any(|d| d == name)
    }

    fn file_allowed(&self, path: &Path) -> Option<Technology> {
        let name = path.file_name()?.to_string_lossy();
        if self
            .excluded_suffixes
            .iter()
            .any(|s| name.ends_with(s.as_str()))
        {
            return None;
        }
        let ext = path.extension()?.to_string_lossy();
        if !self.extensions.is_empty()
            && !self
                .extensions
                .iter()
                .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        {
            return None;
        }
        detect_technology(path)
    }
}

/// A file selected by the walker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkedFile {
    pub absolute: PathBuf,
    /// Key used by the index: relative to the project root, `/`-separated.
    pub relative: String,
    pub technology: Technology,
}

#[derive(Debug, Default)]
pub struct WalkOutcome {
    /// Sorted by relative path, no duplicates.
    pub files: Vec<WalkedFile>,
    /// Input paths that do not exist.
    pub missing: Vec<PathBuf>,
    pub symlink_loops: usize,
}

/// Root-relative POSIX key for an absolute path.
pub fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn build_ignore(walk_root: &Path, filter: &FilterConfig) -> Gitignore {
    let mut builder = GitignoreBuilder::new(walk_root);
    if filter.respect_gitignore {
        let gitignore = walk_root.join(".gitignore");
        if gitignore.is_file() {
            if let Some(err) = builder.add(&gitignore) {
                debug!(path = %gitignore.display(), error = %err, "partial .gitignore");
            }
        }
    }
    for pattern in &filter.exclude_patterns {
        let stripped = pattern.trim();
        if stripped.is_empty() {
            continue;
        }
        if let Err(err) = builder.add_line(None, stripped) {
            warn!(pattern = stripped, error = %err, "ignoring invalid exclude pattern");
        }
    }
    builder.build().unwrap_or_else(|err| {
        warn!(error = %err, "exclude patterns unusable, walking without them");
        Gitignore::empty()
    })
}

/// Walk `paths` (absolute, or relative to `root`) and return every indexable
/// file in lexicographic order.
pub fn walk(root: &Path, paths: &[PathBuf], filter: &FilterConfig) -> WalkOutcome {
    let mut outcome = WalkOutcome::default();
    let mut selected: BTreeMap<String, WalkedFile> = BTreeMap::new();

    for input in paths {
        let absolute = if input.is_absolute() {
            input.clone()
        } else {
            root.join(input)
        };
        if !absolute.exists() {
            outcome.missing.push(absolute);
            continue;
        }

        if absolute.is_file() {
            if let Some(file) = select_file(root, &absolute, filter) {
                selected.insert(file.relative.clone(), file);
            }
            continue;
        }

        let ignore = build_ignore(&absolute, filter);
        let walker = WalkDir::new(&absolute)
            .follow_links(filter.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let is_dir = entry.file_type().is_dir();
                if is_dir && filter.dir_excluded(&entry.file_name().to_string_lossy()) {
                    return false;
                }
                !ignore.matched(entry.path(), is_dir).is_ignore()
            });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    if err.loop_ancestor().is_some() {
                        outcome.symlink_loops += 1;
                        debug!(path = ?err.path(), "skipping symlink loop");
                    } else {
                        debug!(error = %err, "skipping unreadable entry");
                    }
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(file) = select_file(root, entry.path(), filter) {
                selected.insert(file.relative.clone(), file);
            }
        }
    }

    outcome.files = selected.into_values().collect();
    outcome
}

fn select_file(root: &Path, path: &Path, filter: &FilterConfig) -> Option<WalkedFile> {
    let technology = filter.file_allowed(path)?;
    if filter.max_file_size_bytes > 0 {
        let size = path.metadata().map(|m| m.len()).unwrap_or(0);
        if size > filter.max_file_size_bytes {
            debug!(path = %path.display(), size, "skipping oversized file");
            return None;
        }
    }
    Some(WalkedFile {
        absolute: path.to_path_buf(),
        relative: relative_key(root, path),
        technology,
    })
}

/// Technology by extension, case-insensitively.
pub fn detect_technology(path: &Path) -> Option<Technology> {
    let ext = path.extension()?.to_string_lossy();
    Technology::from_extension(&ext)
}

pub fn compute_content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Content hash combined with the modification time.
pub fn compute_fingerprint(data: &[u8], mtime_ns: u128) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.update(mtime_ns.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn mtime_ns(modified: Option<SystemTime>) -> u128 {
    modified
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Read the `module` line of a `go.mod`, if present.
pub fn read_go_module(root: &Path) -> Option<String> {
    let content = std::fs::read_to_string(root.join("go.mod")).ok()?;
    content
        .lines()
        .find_map(|line| line.trim().strip_prefix("module "))
        .map(|m| m.trim().to_string())
}
