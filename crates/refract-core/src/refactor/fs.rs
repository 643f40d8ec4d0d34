//! File access seams used by planning, preview and apply.
//!
//! Reads go through [`SourceReader`] and writes through [`FileSink`], both
//! keyed by root-relative paths, so tests can inject content and failures.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::errors::{RefractError, RefractResult};

pub trait SourceReader: Send + Sync {
    fn read(&self, path: &str) -> RefractResult<String>;
}

pub trait FileSink: Send + Sync {
    /// Replace the whole content of `path`.
    fn write(&self, path: &str, content: &[u8]) -> RefractResult<()>;
}

/// Reads files below a project root.
#[derive(Clone, Debug)]
pub struct FsReader {
    root: PathBuf,
}

impl FsReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SourceReader for FsReader {
    fn read(&self, path: &str) -> RefractResult<String> {
        let absolute = self.root.join(path);
        if !absolute.exists() {
            return Err(RefractError::PathNotFound(absolute));
        }
        Ok(fs::read_to_string(absolute)?)
    }
}

/// Writes through a temp file in the target directory followed by a rename,
/// so a reader sees either the old or the new content.
#[derive(Clone, Debug)]
pub struct AtomicFileSink {
    root: PathBuf,
}

impl AtomicFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileSink for AtomicFileSink {
    fn write(&self, path: &str, content: &[u8]) -> RefractResult<()> {
        atomic_write(&self.root.join(path), content)
    }
}

pub(crate) fn atomic_write(target: &Path, content: &[u8]) -> RefractResult<()> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut staging = NamedTempFile::new_in(parent)?;
    staging.write_all(content)?;
    staging.as_file().sync_all()?;
    if let Ok(meta) = fs::metadata(target) {
        // Keep the mode of the file being replaced.
        fs::set_permissions(staging.path(), meta.permissions())?;
    }
    staging
        .persist(target)
        .map_err(|e| RefractError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/a.py"), "old\n").unwrap();

        let sink = AtomicFileSink::new(dir.path());
        sink.write("pkg/a.py", b"new\n").unwrap();

        let reader = FsReader::new(dir.path());
        assert_eq!(reader.read("pkg/a.py").unwrap(), "new\n");
        let leftovers = fs::read_dir(dir.path().join("pkg")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_reader_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = FsReader::new(dir.path()).read("nope.py").unwrap_err();
        assert!(matches!(err, RefractError::PathNotFound(_)));
    }
}
