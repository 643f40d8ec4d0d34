//! Applying a previewed plan: lock, verify, back up, write, and roll back
//! everything already written if any write fails.


use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{RefractError, RefractResult};
use crate::indexer::filesystem::compute_content_hash;
use crate::refactor::backup::{BackupRecord, BackupStore};
use crate::refactor::diff::{apply_edits, Edit};
use crate::refactor::fs::{FileSink, SourceReader};
use crate::refactor::locks::PathLocks;
use crate::refactor::plan::RefactorPlan;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub plan_id: String,
    pub files_written: Vec<String>,
    pub backups: Vec<BackupRecord>,
}

pub struct ApplyContext<'a> {
    pub reader: &'a dyn SourceReader,
    pub sink: &'a dyn FileSink,
    pub backups: &'a BackupStore,
    pub locks: &'a PathLocks,
}

/// Write every edit of `plan`. Writes are not retried; on the first failure
/// the files already written are restored from their backups and the
/// outcome of each restore is reported in the error.
pub fn apply(plan: &RefactorPlan, ctx: &ApplyContext<'_>) -> RefractResult<ApplyReport> {
    let paths = plan.paths();
    let _guard = ctx.locks.try_lock_all(paths.iter().copied())?;

    // Verify and render everything before touching the disk.
    let mut staged: Vec<(&str, String, String)> = Vec::with_capacity(paths.len());
    for path in &paths {
        let edits: Vec<&Edit> = plan.edits_for(path).collect();
        let current = ctx.reader.read(path)?;
        let expected = plan.base_hashes.get(*path).map(String::as_str);
        if expected != Some(compute_content_hash(current.as_bytes()).as_str()) {
            return Err(RefractError::PlanExpired {
                plan_id: plan.id.clone(),
                reason: format!("{path} changed since planning"),
            });
        }
        let updated = apply_edits(&current, &edits)?;
        staged.push((*path, current, updated));
    }

    let mut backups: Vec<BackupRecord> = Vec::with_capacity(staged.len());
    for (path, current, _) in &staged {
        match ctx.backups.create(path, current.as_bytes()) {
            Ok(record) => backups.push(record),
            Err(e) => {
                for record in &backups {
                    if let Err(cleanup) = ctx.backups.cleanup(record) {
                        warn!(original = %record.original, error = %cleanup, "backup cleanup failed");
                    }
                }
                return Err(e);
            }
        }
    }

    let mut written: Vec<usize> = Vec::with_capacity(staged.len());
    for (i, (path, _, updated)) in staged.iter().enumerate() {
        if let Err(e) = ctx.sink.write(path, updated.as_bytes()) {
            warn!(plan_id = %plan.id, path, error = %e, "write failed, rolling back");
            return Err(roll_back(plan, path, e, &written, &staged, &backups, ctx));
        }
        written.push(i);
    }

    let files_written: Vec<String> = staged.iter().map(|(p, _, _)| p.to_string()).collect();
    info!(
        plan_id = %plan.id,
        files = files_written.len(),
        "refactor applied"
    );
    Ok(ApplyReport {
        plan_id: plan.id.clone(),
        files_written,
        backups,
    })
}

fn roll_back(
    plan: &RefactorPlan,
    failed_path: &str,
    cause: RefractError,
    written: &[usize],
    staged: &[(&str, String, String)],
    backups: &[BackupRecord],
    ctx: &ApplyContext<'_>,
) -> RefractError {
    let mut rolled_back = Vec::new();
    let mut rollback_failures = Vec::new();
    for &i in written.iter().rev() {
        let path = staged[i].0;
        match ctx.backups.restore(&backups[i]) {
            Ok(()) => {
                info!(plan_id = %plan.id, path, "rolled back");
                rolled_back.push(path.to_string());
            }
            Err(e) => {
                warn!(plan_id = %plan.id, path, error = %e, "rollback failed");
                rollback_failures.push(format!("{path}: {e}"));
            }
        }
    }
    RefractError::PartialApplyFailure {
        failed_path: failed_path.to_string(),
        cause: cause.to_string(),
        succeeded: written.iter().map(|&i| staged[i].0.to_string()).collect(),
        rolled_back,
        rollback_failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LineIndex;
    use crate::refactor::fs::{AtomicFileSink, FsReader};
    use crate::refactor::plan::{RefactorIntent, RefactorTarget, RiskLevel};
    use chrono::{DateTime, Utc};
    use std::collections::BTreeMap;
    use std::fs;
    use std::time::SystemTime;
    use tempfile::TempDir;

    /// Fails on the write of one path and delegates the rest.
    struct FailingSink {
        inner: AtomicFileSink,
        fail_on: String,
    }

    impl FileSink for FailingSink {
        fn write(&self, path: &str, content: &[u8]) -> RefractResult<()> {
            if path == self.fail_on {
                return Err(RefractError::Io(std::io::Error::other("disk full")));
            }
            self.inner.write(path, content)
        }
    }

    fn rename_plan(dir: &TempDir, files: &[(&str, &str)]) -> RefactorPlan {
        let mut edits = Vec::new();
        let mut base_hashes = BTreeMap::new();
        for (path, src) in files {
            fs::write(dir.path().join(path), src).unwrap();
            let at = src.find("old").unwrap();
            edits.push(Edit {
                path: path.to_string(),
                span: LineIndex::new(src).span(at, at + 3),
                original: "old".to_string(),
                replacement: "new".to_string(),
            });
            base_hashes.insert(path.to_string(), compute_content_hash(src.as_bytes()));
        }
        let created_at: DateTime<Utc> = SystemTime::now().into();
        RefactorPlan {
            id: "abc123def456".to_string(),
            target: RefactorTarget::Symbol {
                name: "old".to_string(),
                path: None,
            },
            intent: RefactorIntent::Rename {
                new_name: "new".to_string(),
            },
            symbol: None,
            edits,
            risk: RiskLevel::Low,
            affected_files: vec![],
            transitive_dependents: vec![],
            warnings: vec![],
            generation: 1,
            created_at,
            base_hashes,
        }
    }

    const FILES: [(&str, &str); 3] = [
        ("a.py", "def old():\n    pass\n"),
        ("b.py", "from a import old\n"),
        ("c.py", "old()\n"),
    ];

    #[test]
    fn test_apply_writes_and_backs_up() {
        let dir = TempDir::new().unwrap();
        let plan = rename_plan(&dir, &FILES);
        let reader = FsReader::new(dir.path());
        let sink = AtomicFileSink::new(dir.path());
        let backups = BackupStore::new(dir.path(), ".refract/backups");
        let locks = PathLocks::new();
        let ctx = ApplyContext {
            reader: &reader,
            sink: &sink,
            backups: &backups,
            locks: &locks,
        };
        let report = apply(&plan, &ctx).unwrap();
        assert_eq!(report.files_written, vec!["a.py", "b.py", "c.py"]);
        assert_eq!(report.backups.len(), 3);
        assert_eq!(
            fs::read_to_string(dir.path().join("c.py")).unwrap(),
            "new()\n"
        );
        assert!(!locks.is_locked("a.py"));
    }

    #[test]
    fn test_failure_on_second_file_rolls_back_first() {
        let dir = TempDir::new().unwrap();
        let plan = rename_plan(&dir, &FILES);
        let reader = FsReader::new(dir.path());
        let sink = FailingSink {
            inner: AtomicFileSink::new(dir.path()),
            fail_on: "b.py".to_string(),
        };
        let backups = BackupStore::new(dir.path(), ".refract/backups");
        let locks = PathLocks::new();
        let ctx = ApplyContext {
            reader: &reader,
            sink: &sink,
            backups: &backups,
            locks: &locks,
        };
        let err = apply(&plan, &ctx).unwrap_err();
        match err {
            RefractError::PartialApplyFailure {
                failed_path,
                succeeded,
                rolled_back,
                rollback_failures,
                cause,
            } => {
                assert_eq!(failed_path, "b.py");
                assert_eq!(succeeded, vec!["a.py"]);
                assert_eq!(rolled_back, vec!["a.py"]);
                assert!(rollback_failures.is_empty());
                assert!(cause.contains("disk full"));
            }
            other => panic!("unexpected error: {other}"),
        }
        for (path, src) in FILES {
            assert_eq!(fs::read_to_string(dir.path().join(path)).unwrap(), src);
        }
    }

    #[test]
    fn test_changed_file_expires_plan() {
        let dir = TempDir::new().unwrap();
        let plan = rename_plan(&dir, &FILES);
        fs::write(dir.path().join("c.py"), "old()\nold()\n").unwrap();
        let reader = FsReader::new(dir.path());
        let sink = AtomicFileSink::new(dir.path());
        let backups = BackupStore::new(dir.path(), ".refract/backups");
        let locks = PathLocks::new();
        let ctx = ApplyContext {
            reader: &reader,
            sink: &sink,
            backups: &backups,
            locks: &locks,
        };
        let err = apply(&plan, &ctx).unwrap_err();
        assert!(matches!(err, RefractError::PlanExpired { .. }));
        assert_eq!(
            fs::read_to_string(dir.path().join("a.py")).unwrap(),
            FILES[0].1
        );
        assert!(backups.list().unwrap().is_empty());
    }

    #[test]
    fn test_held_lock_conflicts() {
        let dir = TempDir::new().unwrap();
        let plan = rename_plan(&dir, &FILES);
        let reader = FsReader::new(dir.path());
        let sink = AtomicFileSink::new(dir.path());
        let backups = BackupStore::new(dir.path(), ".refract/backups");
        let locks = PathLocks::new();
        let _held = locks.try_lock_all(["b.py"]).unwrap();
        let ctx = ApplyContext {
            reader: &reader,
            sink: &sink,
            backups: &backups,
            locks: &locks,
        };
        let err = apply(&plan, &ctx).unwrap_err();
        assert!(matches!(err, RefractError::ConcurrentWriteConflict(p) if p == "b.py"));
    }
}
