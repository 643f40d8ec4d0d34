//! In-memory project index with generation-stamped, copy-on-write snapshots.
//!
//! The index is the single source of truth for every analysis. Readers take
//! an `Arc<IndexSnapshot>` and keep it for the whole operation; writers are
//! serialized and publish a new snapshot in one swap.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::models::{Declaration, FileRecord, Scope, StructuralUnit, SymbolId};

/// One file's record together with its structural unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexedFile {
    pub record: FileRecord,
    pub unit: StructuralUnit,
}

impl IndexedFile {
    /// Same content and same parse outcome; metadata such as mtime may differ.
    fn same_content(&self, other: &IndexedFile) -> bool {
        self.record.content_hash == other.record.content_hash
            && self.record.technology == other.record.technology
            && self.record.status == other.record.status
            && self.unit == other.unit
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable view of the index at one generation.
#[derive(Clone, Debug, Default)]
pub struct IndexSnapshot {
    generation: u64,
    files: BTreeMap<String, Arc<IndexedFile>>,
    go_module: Option<String>,
}

impl IndexSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, path: &str) -> Option<&Arc<IndexedFile>> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files in path order.
    pub fn files(&self) -> impl Iterator<Item = (&String, &Arc<IndexedFile>)> {
        self.files.iter()
    }

    pub fn files_in<'a>(
        &'a self,
        scope: &'a Scope,
    ) -> impl Iterator<Item = (&'a String, &'a Arc<IndexedFile>)> + 'a {
        self.files.iter().filter(move |(path, _)| scope.contains(path))
    }

    pub fn paths(&self) -> BTreeSet<String> {
        self.files.keys().cloned().collect()
    }

    /// Module path declared by the root `go.mod`, if any.
    pub fn go_module(&self) -> Option<&str> {
        self.go_module.as_deref()
    }

    /// Paths added, removed or modified between `older` and this snapshot.
    pub fn changed_since(&self, older: &IndexSnapshot) -> Vec<String> {
        let mut changed: Vec<String> = Vec::new();
        for (path, file) in &self.files {
            match older.files.get(path) {
                Some(previous) if Arc::ptr_eq(previous, file) || previous.same_content(file) => {}
                _ => changed.push(path.clone()),
            }
        }
        for path in older.files.keys() {
            if !self.files.contains_key(path) {
                changed.push(path.clone());
            }
        }
        changed.sort();
        changed
    }

    /// Symbol declarations whose simple or qualified name equals `name`.
    pub fn declarations_named(&self, name: &str) -> Vec<(SymbolId, &Declaration)> {
        let mut out = Vec::new();
        for (path, file) in &self.files {
            for decl in file.unit.all_declarations() {
                if decl.kind.is_symbol() && (decl.name == name || decl.qualified_name == name) {
                    out.push((SymbolId::new(path.as_str(), decl.qualified_name.as_str()), decl));
                }
            }
        }
        out
    }

    pub fn symbol(&self, id: &SymbolId) -> Option<&Declaration> {
        self.files
            .get(&id.path)?
            .unit
            .find_qualified(&id.qualified_name)
    }
}

// ---------------------------------------------------------------------------
// Writer side
// ---------------------------------------------------------------------------

/// One entry of a change set passed to [`ProjectIndex::commit`].
#[derive(Clone, Debug)]
pub enum IndexChange {
    Upsert(FileRecord, StructuralUnit),
    Remove(String),
    GoModule(Option<String>),
}

/// Counts of what a commit actually changed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub generation: u64,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub go_module_changed: bool,
}

impl CommitOutcome {
    pub fn changed(&self) -> bool {
        self.added + self.modified + self.removed > 0 || self.go_module_changed
    }
}

#[derive(Debug, Default)]
pub struct ProjectIndex {
    current: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<()>,
}

impl ProjectIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    pub fn get(&self, path: &str) -> Option<Arc<IndexedFile>> {
        self.current.read().files.get(path).cloned()
    }

    pub fn all_files(&self) -> Vec<FileRecord> {
        self.current
            .read()
            .files
            .values()
            .map(|f| f.record.clone())
            .collect()
    }

    pub fn upsert(&self, record: FileRecord, unit: StructuralUnit) -> CommitOutcome {
        self.commit(vec![IndexChange::Upsert(record, unit)])
    }

    pub fn remove(&self, path: &str) -> CommitOutcome {
        self.commit(vec![IndexChange::Remove(path.to_string())])
    }

    /// Apply a change set. The generation advances once if anything in the
    /// set added, removed or modified a file; a refresh that only changes
    /// file metadata is stored without a bump.
    pub fn commit(&self, changes: Vec<IndexChange>) -> CommitOutcome {
        let _guard = self.writer.lock();
        let base = self.snapshot();
        let mut files = base.files.clone();
        let mut go_module = base.go_module.clone();
        let mut outcome = CommitOutcome::default();
        let mut refreshed = false;

        for change in changes {
            match change {
                IndexChange::Upsert(record, unit) => {
                    let path = record.path.clone();
                    let incoming = IndexedFile { record, unit };
                    let comparison = files
                        .get(&path)
                        .map(|existing| (**existing == incoming, existing.same_content(&incoming)));
                    let (identical, same_content) = match comparison {
                        Some(flags) => flags,
                        None => {
                            outcome.added += 1;
                            files.insert(path, Arc::new(incoming));
                            continue;
                        }
                    };
                    if identical {
                        outcome.unchanged += 1;
                        continue;
                    }
                    if same_content {
                        outcome.unchanged += 1;
                        refreshed = true;
                    } else {
                        outcome.modified += 1;
                    }
                    files.insert(path, Arc::new(incoming));
                }
                IndexChange::Remove(path) => {
                    if files.remove(&path).is_some() {
                        outcome.removed += 1;
                    }
                }
                IndexChange::GoModule(module) => {
                    if module != go_module {
                        go_module = module;
                        outcome.go_module_changed = true;
                    }
                }
            }
        }

        let generation = if outcome.changed() {
            base.generation + 1
        } else {
            base.generation
        };
        outcome.generation = generation;
        if outcome.changed() || refreshed {
            *self.current.write() = Arc::new(IndexSnapshot {
                generation,
                files,
                go_module,
            });
        }
        debug!(
            generation,
            added = outcome.added,
            modified = outcome.modified,
            removed = outcome.removed,
            "index commit"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeclarationKind, ParseStatus, Span, Technology};

    fn record(path: &str, hash: &str, mtime: u128) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            technology: Technology::Python,
            fingerprint: format!("{hash}-{mtime}"),
            content_hash: hash.to_string(),
            size_bytes: 10,
            mtime_ns: mtime,
            line_count: 1,
            status: ParseStatus::Parsed,
        }
    }

    fn unit_with(name: &str) -> StructuralUnit {
        StructuralUnit {
            declarations: vec![Declaration {
                name: name.to_string(),
                qualified_name: format!("m.{name}"),
                kind: DeclarationKind::Function,
                span: Span::new(0, 10, 1, 1),
                name_span: Span::new(4, 5, 1, 1),
                complexity: 1,
                max_nesting: 0,
                children: vec![],
            }],
            ..StructuralUnit::default()
        }
    }

    #[test]
    fn test_generation_bumps_once_per_change_set() {
        let index = ProjectIndex::new();
        let outcome = index.commit(vec![
            IndexChange::Upsert(record("a.py", "h1", 1), unit_with("f")),
            IndexChange::Upsert(record("b.py", "h2", 1), unit_with("g")),
        ]);
        assert_eq!(outcome.generation, 1);
        assert_eq!(outcome.added, 2);
        assert_eq!(index.all_files().len(), 2);
    }

    #[test]
    fn test_unchanged_upsert_is_a_skip() {
        let index = ProjectIndex::new();
        index.upsert(record("a.py", "h1", 1), unit_with("f"));
        let again = index.upsert(record("a.py", "h1", 1), unit_with("f"));
        assert_eq!(again.generation, 1);
        assert_eq!(again.unchanged, 1);

        let touched = index.upsert(record("a.py", "h1", 2), unit_with("f"));
        assert_eq!(touched.generation, 1);
        assert_eq!(index.get("a.py").unwrap().record.mtime_ns, 2);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let index = ProjectIndex::new();
        index.upsert(record("a.py", "h1", 1), unit_with("f"));
        let before = index.snapshot();
        index.upsert(record("a.py", "h2", 2), unit_with("g"));
        index.remove("missing.py");
        assert_eq!(before.generation(), 1);
        assert_eq!(before.get("a.py").unwrap().record.content_hash, "h1");
        assert_eq!(index.generation(), 2);
    }

    #[test]
    fn test_changed_since() {
        let index = ProjectIndex::new();
        index.commit(vec![
            IndexChange::Upsert(record("a.py", "h1", 1), unit_with("f")),
            IndexChange::Upsert(record("b.py", "h2", 1), unit_with("g")),
        ]);
        let old = index.snapshot();
        index.commit(vec![
            IndexChange::Upsert(record("a.py", "h3", 1), unit_with("f")),
            IndexChange::Remove("b.py".to_string()),
            IndexChange::Upsert(record("c.py", "h4", 1), unit_with("h")),
        ]);
        let new = index.snapshot();
        assert_eq!(new.changed_since(&old), vec!["a.py", "b.py", "c.py"]);
        assert!(new.changed_since(&new).is_empty());
    }

    #[test]
    fn test_symbol_lookup() {
        let index = ProjectIndex::new();
        index.upsert(record("a.py", "h1", 1), unit_with("f"));
        let snap = index.snapshot();
        let found = snap.declarations_named("f");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, SymbolId::new("a.py", "m.f"));
        assert!(snap.symbol(&found[0].0).is_some());
        assert_eq!(snap.declarations_named("m.f").len(), 1);
    }
}
