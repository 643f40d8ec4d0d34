//! Indexing pipeline orchestration with Rayon-based parallelism.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{RefractError, RefractResult};
use crate::indexer::filesystem::{
    compute_content_hash, compute_fingerprint, mtime_ns, read_go_module, relative_key, walk,
    FilterConfig, WalkedFile,
};
use crate::indexer::parser::parse;
use crate::models::{FileRecord, ParseStatus, StructuralUnit};
use crate::store::index::{IndexChange, IndexSnapshot, ProjectIndex};

/// Upper bound on parser threads; each holds one open file at a time.
pub const MAX_WORKERS: usize = 64;

/// Files modified this close to the start of a pass are stored with a zero
/// mtime, so the next pass hashes them instead of trusting mtime and size.
/// Covers filesystems with coarse (up to 2 s) timestamps.
pub const RACY_WINDOW_NS: u128 = 2_000_000_000;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation, checked between files.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> RefractResult<()> {
        if self.is_cancelled() {
            Err(RefractError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexFailure {
    pub path: String,
    /// `walk`, `read` or `parse`.
    pub stage: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    pub generation: u64,
    pub files_seen: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub symlink_loops: usize,
    pub failures: Vec<IndexFailure>,
    pub elapsed_ms: u64,
}

// ---------------------------------------------------------------------------
// Per-file work
// ---------------------------------------------------------------------------

enum Extraction {
    Upsert(FileRecord, StructuralUnit, Option<IndexFailure>),
    Failed(IndexFailure),
}

fn extract_file_worker(
    file: &WalkedFile,
    snapshot: &IndexSnapshot,
    pass_started_ns: u128,
) -> Extraction {
    let bytes = match std::fs::read(&file.absolute) {
        Ok(b) => b,
        Err(e) => {
            return Extraction::Failed(IndexFailure {
                path: file.relative.clone(),
                stage: "read".to_string(),
                message: RefractError::Io(e).to_string(),
            })
        }
    };
    let mtime = mtime_ns(file.absolute.metadata().and_then(|m| m.modified()).ok());
    let content_hash = compute_content_hash(&bytes);
    let racy = mtime.saturating_add(RACY_WINDOW_NS) > pass_started_ns;
    let mut record = FileRecord {
        path: file.relative.clone(),
        technology: file.technology,
        fingerprint: compute_fingerprint(&bytes, mtime),
        content_hash,
        size_bytes: bytes.len() as u64,
        mtime_ns: if racy { 0 } else { mtime },
        line_count: 0,
        status: ParseStatus::Unparsed,
    };

    // Same bytes as last time: keep the stored unit, refresh metadata only.
    if let Some(existing) = snapshot.get(&file.relative) {
        if existing.record.content_hash == record.content_hash
            && existing.record.technology == record.technology
        {
            record.line_count = existing.record.line_count;
            record.status = existing.record.status.clone();
            return Extraction::Upsert(record, existing.unit.clone(), None);
        }
    }

    let source = String::from_utf8_lossy(&bytes);
    record.line_count = source.lines().count();
    match parse(&file.relative, &source, file.technology) {
        Ok(unit) => {
            record.status = ParseStatus::Parsed;
            Extraction::Upsert(record, unit, None)
        }
        Err(failure) => {
            warn!(path = %file.relative, reason = %failure.reason, "parse failed");
            let message = RefractError::ParseFailure {
                path: file.relative.clone(),
                reason: failure.reason.clone(),
            }
            .to_string();
            record.status = ParseStatus::ParseFailed {
                reason: failure.reason,
            };
            Extraction::Upsert(
                record,
                failure.partial,
                Some(IndexFailure {
                    path: file.relative.clone(),
                    stage: "parse".to_string(),
                    message,
                }),
            )
        }
    }
}

/// Whether size and mtime match the stored record, so the file can be
/// skipped without reading it.
///
/// A same-size rewrite that keeps the mtime goes unnoticed here. The stored
/// mtime is only non-zero when the file was already [`RACY_WINDOW_NS`] older
/// than the pass that recorded it, so such a rewrite needs either a clock
/// step back or an explicit mtime reset.
fn unchanged_on_disk(file: &WalkedFile, snapshot: &IndexSnapshot) -> bool {
    let Some(existing) = snapshot.get(&file.relative) else {
        return false;
    };
    let Ok(meta) = file.absolute.metadata() else {
        return false;
    };
    let mtime = mtime_ns(meta.modified().ok());
    mtime != 0
        && existing.record.mtime_ns == mtime
        && existing.record.size_bytes == meta.len()
        && existing.record.technology == file.technology
}

fn parallel_extract(
    files: &[&WalkedFile],
    snapshot: &IndexSnapshot,
    pass_started_ns: u128,
    workers: usize,
    cancel: &CancellationToken,
) -> Vec<Option<Extraction>> {
    if files.is_empty() {
        return vec![];
    }

    let run = |file: &&WalkedFile| {
        if cancel.is_cancelled() {
            return None;
        }
        Some(extract_file_worker(file, snapshot, pass_started_ns))
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.clamp(1, MAX_WORKERS))
        .build();

    match pool {
        Ok(pool) => pool.install(|| files.par_iter().map(run).collect()),
        Err(err) => {
            warn!(error = %err, "thread pool unavailable, extracting sequentially");
            files.iter().map(run).collect()
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Walk, parse and commit `paths` under `root` as one change set.
///
/// Indexed files under the walked paths that no longer exist (or no longer
/// pass the filter) are removed. On cancellation nothing is committed.
pub fn index_paths(
    index: &ProjectIndex,
    root: &Path,
    paths: &[PathBuf],
    filter: &FilterConfig,
    workers: usize,
    cancel: &CancellationToken,
) -> RefractResult<IndexSummary> {
    let started = Instant::now();
    let pass_started_ns = mtime_ns(Some(SystemTime::now()));
    let paths: Vec<PathBuf> = if paths.is_empty() {
        vec![root.to_path_buf()]
    } else {
        paths.to_vec()
    };
    info!(root = %root.display(), inputs = paths.len(), workers, "indexing started");

    let walked = walk(root, &paths, filter);
    cancel.check()?;
    let snapshot = index.snapshot();
    let mut summary = IndexSummary {
        files_seen: walked.files.len(),
        symlink_loops: walked.symlink_loops,
        ..IndexSummary::default()
    };

    for missing in &walked.missing {
        summary.failures.push(IndexFailure {
            path: relative_key(root, missing),
            stage: "walk".to_string(),
            message: RefractError::PathNotFound(missing.clone()).to_string(),
        });
    }

    let (fresh, work): (Vec<&WalkedFile>, Vec<&WalkedFile>) = walked
        .files
        .iter()
        .partition(|f| unchanged_on_disk(f, &snapshot));
    debug!(fast_path = fresh.len(), to_read = work.len(), "files classified");

    let extracted = parallel_extract(&work, &snapshot, pass_started_ns, workers, cancel);
    if cancel.is_cancelled() || extracted.iter().any(Option::is_none) {
        info!("indexing cancelled, nothing committed");
        return Err(RefractError::Cancelled);
    }

    let mut changes = Vec::new();
    for extraction in extracted.into_iter().flatten() {
        match extraction {
            Extraction::Upsert(record, unit, failure) => {
                changes.push(IndexChange::Upsert(record, unit));
                summary.failures.extend(failure);
            }
            Extraction::Failed(failure) => summary.failures.push(failure),
        }
    }

    // Vanished files: indexed under a walked input but not walked now.
    let walked_keys: BTreeSet<&str> = walked.files.iter().map(|f| f.relative.as_str()).collect();
    let prefixes: Vec<String> = paths
        .iter()
        .map(|p| {
            let absolute = if p.is_absolute() { p.clone() } else { root.join(p) };
            relative_key(root, &absolute)
        })
        .collect();
    for (path, _) in snapshot.files() {
        let under_input = prefixes.iter().any(|prefix| {
            prefix.is_empty()
                || path == prefix
                || (path.starts_with(prefix.as_str())
                    && path.as_bytes().get(prefix.len()) == Some(&b'/'))
        });
        if under_input && !walked_keys.contains(path.as_str()) {
            changes.push(IndexChange::Remove(path.clone()));
        }
    }

    changes.push(IndexChange::GoModule(read_go_module(root)));
    cancel.check()?;

    let outcome = index.commit(changes);
    summary.generation = outcome.generation;
    summary.files_indexed = outcome.added + outcome.modified;
    summary.files_unchanged = fresh.len() + outcome.unchanged;
    summary.files_removed = outcome.removed;
    summary.elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        generation = summary.generation,
        seen = summary.files_seen,
        indexed = summary.files_indexed,
        unchanged = summary.files_unchanged,
        removed = summary.files_removed,
        failures = summary.failures.len(),
        elapsed_ms = summary.elapsed_ms,
        "indexing finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn run(index: &ProjectIndex, root: &Path) -> IndexSummary {
        index_paths(
            index,
            root,
            &[],
            &FilterConfig::default(),
            2,
            &CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_index_and_reindex_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "pkg/a.py", "def f():\n    return 1\n");
        write(dir.path(), "pkg/b.py", "from pkg.a import f\n");
        let index = ProjectIndex::new();

        let first = run(&index, dir.path());
        assert_eq!(first.generation, 1);
        assert_eq!(first.files_indexed, 2);

        let before = index.snapshot();
        let second = run(&index, dir.path());
        assert_eq!(second.generation, 1);
        assert_eq!(second.files_indexed, 0);
        assert_eq!(second.files_unchanged, 2);
        assert!(index.snapshot().changed_since(&before).is_empty());
    }

    fn set_mtime(root: &Path, rel: &str, at: SystemTime) {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(root.join(rel))
            .unwrap();
        file.set_modified(at).unwrap();
    }

    #[test]
    fn test_same_size_rewrite_with_recent_mtime_is_reread() {
        let dir = tempfile::tempdir().unwrap();
        let at = SystemTime::now();
        write(dir.path(), "a.py", "x = 1\n");
        set_mtime(dir.path(), "a.py", at);
        let index = ProjectIndex::new();
        run(&index, dir.path());
        assert_eq!(index.get("a.py").unwrap().record.mtime_ns, 0);

        write(dir.path(), "a.py", "x = 2\n");
        set_mtime(dir.path(), "a.py", at);
        let summary = run(&index, dir.path());
        assert_eq!(summary.files_indexed, 1);
        assert_eq!(summary.generation, 2);
        assert_eq!(
            index.get("a.py").unwrap().record.content_hash,
            compute_content_hash(b"x = 2\n")
        );
    }

    #[test]
    fn test_old_files_take_the_metadata_fast_path() {
        let dir = tempfile::tempdir().unwrap();
        let old = SystemTime::now() - std::time::Duration::from_secs(3600);
        write(dir.path(), "a.py", "x = 1\n");
        set_mtime(dir.path(), "a.py", old);
        let index = ProjectIndex::new();
        run(&index, dir.path());
        assert_ne!(index.get("a.py").unwrap().record.mtime_ns, 0);

        let again = run(&index, dir.path());
        assert_eq!(again.files_unchanged, 1);
        assert_eq!(again.generation, 1);
    }

    #[test]
    fn test_removed_file_leaves_index() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", "x = 1\n");
        write(dir.path(), "b.py", "y = 2\n");
        let index = ProjectIndex::new();
        run(&index, dir.path());
        fs::remove_file(dir.path().join("b.py")).unwrap();
        let summary = run(&index, dir.path());
        assert_eq!(summary.files_removed, 1);
        assert_eq!(summary.generation, 2);
        assert!(index.get("b.py").is_none());
    }

    #[test]
    fn test_parse_failure_is_stored_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bad.py", "def broken(:\n    pass\n");
        write(dir.path(), "good.py", "def ok():\n    pass\n");
        let index = ProjectIndex::new();
        let summary = run(&index, dir.path());
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].stage, "parse");
        assert!(index.get("bad.py").unwrap().record.status.is_failed());
        assert_eq!(index.get("good.py").unwrap().record.status, ParseStatus::Parsed);
    }

    #[test]
    fn test_missing_path_reported() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", "x = 1\n");
        let index = ProjectIndex::new();
        let summary = index_paths(
            &index,
            dir.path(),
            &[PathBuf::from("a.py"), PathBuf::from("nope")],
            &FilterConfig::default(),
            1,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(summary.files_indexed, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].stage, "walk");
    }

    #[test]
    fn test_cancelled_run_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.py", "x = 1\n");
        let index = ProjectIndex::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = index_paths(&index, dir.path(), &[], &FilterConfig::default(), 1, &cancel);
        assert!(matches!(result, Err(RefractError::Cancelled)));
        assert_eq!(index.generation(), 0);
        assert!(index.all_files().is_empty());
    }
}
