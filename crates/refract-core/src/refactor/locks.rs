//! Per-path write locks held for the backup, write and rename of an apply.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::errors::{RefractError, RefractResult};

#[derive(Clone, Debug, Default)]
pub struct PathLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every lock in `paths` or none of them. Fails immediately with
    /// `ConcurrentWriteConflict` naming the first path already held.
    pub fn try_lock_all<I, S>(&self, paths: I) -> RefractResult<PathLockGuard>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wanted: BTreeSet<String> = paths.into_iter().map(Into::into).collect();
        let mut held = self.held.lock();
        if let Some(busy) = wanted.iter().find(|p| held.contains(p.as_str())) {
            return Err(RefractError::ConcurrentWriteConflict(busy.clone()));
        }
        held.extend(wanted.iter().cloned());
        debug!(count = wanted.len(), "path locks acquired");
        Ok(PathLockGuard {
            held: Arc::clone(&self.held),
            paths: wanted,
        })
    }

    pub fn is_locked(&self, path: &str) -> bool {
        self.held.lock().contains(path)
    }
}

/// Releases its paths on drop.
#[derive(Debug)]
pub struct PathLockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    paths: BTreeSet<String>,
}

impl PathLockGuard {
    pub fn paths(&self) -> &BTreeSet<String> {
        &self.paths
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock();
        for path in &self.paths {
            held.remove(path);
        }
    }
}
