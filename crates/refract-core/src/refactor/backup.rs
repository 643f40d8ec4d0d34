//! Backup copies of files taken before an apply overwrites them.
//!
//! A backup is named `<encoded path>.<timestamp>.bak`, where the encoded
//! path escapes `%` as `%25` and `/` as `%2F` and the timestamp is UTC with
//! microseconds. The name alone is enough to list and restore backups.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{RefractError, RefractResult};
use crate::refactor::fs::atomic_write;

pub const DEFAULT_BACKUP_DIR: &str = ".refract/backups";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%6fZ";
const BACKUP_SUFFIX: &str = ".bak";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Root-relative path of the file that was backed up.
    pub original: String,
    pub backup_path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

pub fn encode_path(path: &str) -> String {
    path.replace('%', "%25").replace('/', "%2F")
}

pub fn decode_path(encoded: &str) -> String {
    encoded.replace("%2F", "/").replace("%25", "%")
}

pub fn backup_file_name(original: &str, timestamp: &DateTime<Utc>) -> String {
    format!(
        "{}.{}{BACKUP_SUFFIX}",
        encode_path(original),
        timestamp.format(TIMESTAMP_FORMAT)
    )
}

/// Inverse of [`backup_file_name`].
pub fn parse_backup_file_name(name: &str) -> Option<(String, DateTime<Utc>)> {
    let stem = name.strip_suffix(BACKUP_SUFFIX)?;
    let (encoded, stamp) = stem.rsplit_once('.')?;
    if encoded.is_empty() {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    Some((decode_path(encoded), naive.and_utc()))
}

#[derive(Clone, Debug)]
pub struct BackupStore {
    root: PathBuf,
    dir: PathBuf,
}

impl BackupStore {
    /// `dir` is resolved against `root` when relative.
    pub fn new(root: impl Into<PathBuf>, dir: impl AsRef<Path>) -> Self {
        let root = root.into();
        let dir = if dir.as_ref().is_absolute() {
            dir.as_ref().to_path_buf()
        } else {
            root.join(dir)
        };
        Self { root, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn create(&self, original: &str, content: &[u8]) -> RefractResult<BackupRecord> {
        fs::create_dir_all(&self.dir)?;
        let now: DateTime<Utc> = SystemTime::now().into();
        let mut timestamp = now.trunc_subsecs(6);
        loop {
            let backup_path = self.dir.join(backup_file_name(original, &timestamp));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&backup_path)
            {
                Ok(mut file) => {
                    let written = file.write_all(content).and_then(|_| file.sync_all());
                    if let Err(e) = written {
                        drop(file);
                        let _ = fs::remove_file(&backup_path);
                        return Err(e.into());
                    }
                    info!(original, backup = %backup_path.display(), "backup created");
                    return Ok(BackupRecord {
                        original: original.to_string(),
                        backup_path,
                        timestamp,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    timestamp += TimeDelta::microseconds(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write the backed-up bytes over the original file.
    pub fn restore(&self, record: &BackupRecord) -> RefractResult<()> {
        let content = match fs::read(&record.backup_path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RefractError::PathNotFound(record.backup_path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let target = self.root.join(&record.original);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write(&target, &content)?;
        info!(original = %record.original, "backup restored");
        Ok(())
    }

    /// Backups currently on disk, ordered by original path then time.
    pub fn list(&self) -> RefractResult<Vec<BackupRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match parse_backup_file_name(name) {
                Some((original, timestamp)) => records.push(BackupRecord {
                    original,
                    backup_path: entry.path(),
                    timestamp,
                }),
                None => debug!(name, "ignoring non-backup file"),
            }
        }
        records.sort_by(|a, b| {
            a.original
                .cmp(&b.original)
                .then(a.timestamp.cmp(&b.timestamp))
        });
        Ok(records)
    }

    pub fn cleanup(&self, record: &BackupRecord) -> RefractResult<()> {
        match fs::remove_file(&record.backup_path) {
            Ok(()) => {
                debug!(backup = %record.backup_path.display(), "backup removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(RefractError::PathNotFound(record.backup_path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_name_round_trip() {
        let ts = NaiveDateTime::parse_from_str("20240102T030405123456Z", TIMESTAMP_FORMAT)
            .unwrap()
            .and_utc();
        let name = backup_file_name("src/100%/a.b.py", &ts);
        assert_eq!(name, "src%2F100%25%2Fa.b.py.20240102T030405123456Z.bak");
        let (original, parsed) = parse_backup_file_name(&name).unwrap();
        assert_eq!(original, "src/100%/a.b.py");
        assert_eq!(parsed, ts);
        assert!(parse_backup_file_name("notes.txt").is_none());
    }

    #[test]
    fn test_create_restore_is_byte_exact() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        let original: &[u8] = b"caf\xc3\xa9\r\nno trailing newline";
        fs::write(dir.path().join("pkg/a.py"), original).unwrap();

        let store = BackupStore::new(dir.path(), DEFAULT_BACKUP_DIR);
        let record = store.create("pkg/a.py", original).unwrap();
        fs::write(dir.path().join("pkg/a.py"), b"clobbered").unwrap();
        store.restore(&record).unwrap();
        assert_eq!(fs::read(dir.path().join("pkg/a.py")).unwrap(), original);
    }

    #[test]
    fn test_list_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path(), "backups");
        assert!(store.list().unwrap().is_empty());

        let first = store.create("a.py", b"1").unwrap();
        let second = store.create("a.py", b"2").unwrap();
        store.create("b/c.py", b"3").unwrap();
        assert!(first.timestamp < second.timestamp);

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0], first);
        assert_eq!(listed[1], second);
        assert_eq!(listed[2].original, "b/c.py");

        store.cleanup(&first).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);
        assert!(matches!(
            store.cleanup(&first),
            Err(RefractError::PathNotFound(_))
        ));
    }
}
