//! Dependency graph derived from one index snapshot.
//!
//! Each file contributes its resolved imports, its resolved references, and
//! the edges those produce. The graph-wide pieces (cycle groups, self
//! imports, centrality) are recomputed from the contributions, so an
//! incremental update only has to redo the dirty files' contributions.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::indexer::callgraph::{resolve_references, FileSymbols, ResolvedReference};
use crate::indexer::cycles::{cycle_groups, Adjacency};
use crate::indexer::imports::{resolve, Resolution, ResolveContext, UnresolvedReason};
use crate::indexer::pagerank::{compute_pagerank, DEFAULT_DAMPING, DEFAULT_EPSILON};
use crate::models::{ReferenceKind, Scope, SymbolId};
use crate::store::index::{IndexSnapshot, IndexedFile};

// ---------------------------------------------------------------------------
// Graph types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Imports,
    Calls,
    Inherits,
    References,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::Imports => "imports",
            EdgeKind::Calls => "calls",
            EdgeKind::Inherits => "inherits",
            EdgeKind::References => "references",
        }
    }

    fn from_reference(kind: ReferenceKind) -> Self {
        match kind {
            ReferenceKind::Call => EdgeKind::Calls,
            ReferenceKind::Inherit => EdgeKind::Inherits,
            ReferenceKind::Use => EdgeKind::References,
        }
    }
}

/// File-level edge. Endpoints are index paths.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
    pub line: usize,
}

/// Symbol-level edge from an enclosing declaration to a resolved target.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SymbolEdge {
    pub source: SymbolId,
    pub target: SymbolId,
    pub kind: EdgeKind,
    pub line: usize,
}

/// One import statement with its resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedImport {
    pub module: String,
    pub line: usize,
    /// Empty when unresolved.
    pub targets: Vec<String>,
    pub unresolved: Option<UnresolvedReason>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnresolvedImport {
    pub path: String,
    pub module: String,
    pub line: usize,
    #[serde(flatten)]
    pub reason: UnresolvedReason,
}

impl UnresolvedImport {
    pub fn is_external(&self) -> bool {
        self.reason == UnresolvedReason::External
    }
}

/// Everything one source file adds to the graph.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FileContribution {
    pub imports: Vec<ResolvedImport>,
    pub references: Vec<ResolvedReference>,
    pub file_edges: Vec<GraphEdge>,
    pub symbol_edges: Vec<SymbolEdge>,
}

impl FileContribution {
    fn import_targets(&self) -> impl Iterator<Item = &String> {
        self.imports.iter().flat_map(|i| i.targets.iter())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DependencyGraph {
    pub generation: u64,
    pub files: BTreeSet<String>,
    pub symbols: BTreeSet<SymbolId>,
    pub per_file: BTreeMap<String, FileContribution>,
    pub file_edges: Vec<GraphEdge>,
    pub symbol_edges: Vec<SymbolEdge>,
    pub unresolved: Vec<UnresolvedImport>,
    pub cycles: Vec<Vec<String>>,
    pub self_imports: Vec<String>,
    pub centrality: BTreeMap<String, f64>,
    pub go_module: Option<String>,
}

// ---------------------------------------------------------------------------
// Per-file contribution
// ---------------------------------------------------------------------------

fn contribute(
    path: &str,
    file: &IndexedFile,
    ctx: &ResolveContext<'_>,
    tables: &HashMap<&str, FileSymbols<'_>>,
) -> FileContribution {
    let unit = &file.unit;
    let mut contribution = FileContribution::default();

    for import in &unit.imports {
        let line = import.span.start_line;
        let resolved = match resolve(path, file.record.technology, import, ctx) {
            Resolution::Resolved(targets) => ResolvedImport {
                module: import.module.clone(),
                line,
                targets,
                unresolved: None,
            },
            Resolution::Unresolved(reason) => ResolvedImport {
                module: import.module.clone(),
                line,
                targets: Vec::new(),
                unresolved: Some(reason),
            },
        };
        for target in &resolved.targets {
            contribution.file_edges.push(GraphEdge {
                source: path.to_string(),
                target: target.clone(),
                kind: EdgeKind::Imports,
                line,
            });
        }
        contribution.imports.push(resolved);
    }

    let imported: Vec<String> = contribution
        .import_targets()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    contribution.references = resolve_references(path, unit, &imported, tables);

    for reference in &contribution.references {
        let Some(target) = &reference.target else {
            continue;
        };
        let kind = EdgeKind::from_reference(reference.kind);
        let line = reference.span.start_line;
        if target.path != path {
            contribution.file_edges.push(GraphEdge {
                source: path.to_string(),
                target: target.path.clone(),
                kind,
                line,
            });
        }
        if let Some(source) = &reference.source {
            contribution.symbol_edges.push(SymbolEdge {
                source: source.clone(),
                target: target.clone(),
                kind,
                line,
            });
        }
    }
    contribution.file_edges.sort();
    contribution.file_edges.dedup();
    contribution.symbol_edges.sort();
    contribution.symbol_edges.dedup();
    contribution
}

fn symbol_tables(snapshot: &IndexSnapshot) -> HashMap<&str, FileSymbols<'_>> {
    snapshot
        .files()
        .map(|(path, file)| (path.as_str(), FileSymbols::new(&file.unit)))
        .collect()
}

fn contribute_all(
    snapshot: &IndexSnapshot,
    dirty: &[&String],
) -> Vec<(String, FileContribution)> {
    let paths = snapshot.paths();
    let ctx = ResolveContext {
        paths: &paths,
        go_module: snapshot.go_module(),
    };
    let tables = symbol_tables(snapshot);
    dirty
        .par_iter()
        .filter_map(|path| {
            snapshot
                .get(path)
                .map(|file| ((*path).clone(), contribute(path, file, &ctx, &tables)))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Build / update
// ---------------------------------------------------------------------------

/// Full build from a snapshot.
pub fn build(snapshot: &IndexSnapshot) -> DependencyGraph {
    let started = Instant::now();
    let all: Vec<&String> = snapshot.files().map(|(path, _)| path).collect();
    let per_file: BTreeMap<String, FileContribution> =
        contribute_all(snapshot, &all).into_iter().collect();
    let graph = assemble(snapshot, per_file);
    debug!(
        generation = graph.generation,
        files = graph.files.len(),
        edges = graph.file_edges.len(),
        cycles = graph.cycles.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "dependency graph built"
    );
    graph
}

/// Incremental update. Only contributions whose source is dirty are
/// recomputed; the result equals `build(snapshot)`.
///
/// Dirty is the changed files, plus files that had an import edge into a
/// changed file, plus every importing file when the set of indexed paths
/// (or the Go module path) changed.
pub fn update(
    previous: &DependencyGraph,
    snapshot: &IndexSnapshot,
    changed: &[String],
) -> DependencyGraph {
    let started = Instant::now();
    let paths = snapshot.paths();
    let layout_changed =
        paths != previous.files || snapshot.go_module() != previous.go_module.as_deref();
    let changed_set: BTreeSet<&String> = changed.iter().collect();

    let mut dirty: BTreeSet<&String> = changed_set
        .iter()
        .copied()
        .filter(|p| snapshot.contains(p))
        .collect();
    for (path, contribution) in &previous.per_file {
        if !snapshot.contains(path) {
            continue;
        }
        let imports_changed = contribution
            .import_targets()
            .any(|target| changed_set.contains(target));
        let has_imports = snapshot
            .get(path)
            .is_some_and(|f| !f.unit.imports.is_empty());
        if imports_changed || (layout_changed && has_imports) {
            dirty.insert(path);
        }
    }
    // Files new to this snapshot always need a contribution.
    for path in &paths {
        if !previous.per_file.contains_key(path) {
            dirty.insert(path);
        }
    }

    let mut per_file: BTreeMap<String, FileContribution> = previous
        .per_file
        .iter()
        .filter(|(path, _)| snapshot.contains(path) && !dirty.contains(path))
        .map(|(path, c)| (path.clone(), c.clone()))
        .collect();
    let dirty_list: Vec<&String> = dirty.into_iter().collect();
    let recomputed = dirty_list.len();
    per_file.extend(contribute_all(snapshot, &dirty_list));

    let graph = assemble(snapshot, per_file);
    debug!(
        generation = graph.generation,
        recomputed,
        files = graph.files.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "dependency graph updated"
    );
    graph
}

fn assemble(
    snapshot: &IndexSnapshot,
    per_file: BTreeMap<String, FileContribution>,
) -> DependencyGraph {
    let files = snapshot.paths();
    let mut symbols = BTreeSet::new();
    for (path, file) in snapshot.files() {
        for decl in file.unit.all_declarations() {
            if decl.kind.is_symbol() {
                symbols.insert(SymbolId::new(path.as_str(), decl.qualified_name.as_str()));
            }
        }
    }

    let mut file_edges = Vec::new();
    let mut symbol_edges = Vec::new();
    let mut unresolved = Vec::new();
    let mut import_adjacency = Adjacency::new();
    let mut self_imports = BTreeSet::new();
    for (path, contribution) in &per_file {
        file_edges.extend(contribution.file_edges.iter().cloned());
        symbol_edges.extend(contribution.symbol_edges.iter().cloned());
        for import in &contribution.imports {
            if let Some(reason) = &import.unresolved {
                unresolved.push(UnresolvedImport {
                    path: path.clone(),
                    module: import.module.clone(),
                    line: import.line,
                    reason: reason.clone(),
                });
            }
            for target in &import.targets {
                if target == path {
                    self_imports.insert(path.clone());
                } else {
                    import_adjacency
                        .entry(path.clone())
                        .or_default()
                        .insert(target.clone());
                }
            }
        }
    }
    file_edges.sort();
    symbol_edges.sort();
    unresolved.sort_by(|a, b| (&a.path, a.line, &a.module).cmp(&(&b.path, b.line, &b.module)));

    let weighted: Vec<(String, String)> = file_edges
        .iter()
        .map(|e| (e.source.clone(), e.target.clone()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let centrality = compute_pagerank(&files, &weighted, DEFAULT_DAMPING, DEFAULT_EPSILON);

    DependencyGraph {
        generation: snapshot.generation(),
        cycles: cycle_groups(&import_adjacency),
        self_imports: self_imports.into_iter().collect(),
        go_module: snapshot.go_module().map(str::to_string),
        files,
        symbols,
        per_file,
        file_edges,
        symbol_edges,
        unresolved,
        centrality,
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

impl DependencyGraph {
    /// Files with any edge into `path`.
    pub fn dependents_of(&self, path: &str) -> BTreeSet<String> {
        self.file_edges
            .iter()
            .filter(|e| e.target == path && e.source != path)
            .map(|e| e.source.clone())
            .collect()
    }

    /// Files `path` has any edge into.
    pub fn dependencies_of(&self, path: &str) -> BTreeSet<String> {
        self.per_file
            .get(path)
            .map(|c| {
                c.file_edges
                    .iter()
                    .filter(|e| e.target != path)
                    .map(|e| e.target.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reverse-dependency BFS up to `max_depth` hops, excluding the seeds.
    pub fn transitive_dependents(
        &self,
        seeds: &BTreeSet<String>,
        max_depth: usize,
    ) -> BTreeMap<String, usize> {
        let mut reverse: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for edge in &self.file_edges {
            if edge.source != edge.target {
                reverse
                    .entry(edge.target.as_str())
                    .or_default()
                    .insert(edge.source.as_str());
            }
        }
        let mut depth_of: BTreeMap<String, usize> = BTreeMap::new();
        let mut queue: VecDeque<(&str, usize)> = seeds.iter().map(|s| (s.as_str(), 0)).collect();
        let mut seen: BTreeSet<&str> = seeds.iter().map(String::as_str).collect();
        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for &caller in reverse.get(node).into_iter().flatten() {
                if seen.insert(caller) {
                    depth_of.insert(caller.to_string(), depth + 1);
                    queue.push_back((caller, depth + 1));
                }
            }
        }
        depth_of
    }

    pub fn in_cycle(&self, path: &str) -> bool {
        self.cycles.iter().any(|group| group.iter().any(|p| p == path))
    }

    /// Reference sites anywhere in the graph that resolved to `symbol`.
    pub fn references_to<'a>(
        &'a self,
        symbol: &'a SymbolId,
    ) -> impl Iterator<Item = (&'a String, &'a ResolvedReference)> + 'a {
        self.per_file.iter().flat_map(move |(path, c)| {
            c.references
                .iter()
                .filter(move |r| r.target.as_ref() == Some(symbol))
                .map(move |r| (path, r))
        })
    }

    pub fn view(&self, scope: &Scope) -> GraphView {
        let nodes = self
            .files
            .iter()
            .filter(|p| scope.contains(p))
            .map(|path| FileNode {
                path: path.clone(),
                centrality: self.centrality.get(path).copied().unwrap_or(0.0),
                fan_in: self.dependents_of(path).len(),
                fan_out: self.dependencies_of(path).len(),
            })
            .collect();
        GraphView {
            generation: self.generation,
            nodes,
            edges: self
                .file_edges
                .iter()
                .filter(|e| scope.contains(&e.source))
                .cloned()
                .collect(),
            symbol_edges: self
                .symbol_edges
                .iter()
                .filter(|e| scope.contains(&e.source.path))
                .cloned()
                .collect(),
            unresolved: self
                .unresolved
                .iter()
                .filter(|u| scope.contains(&u.path))
                .cloned()
                .collect(),
            cycles: self
                .cycles
                .iter()
                .filter(|group| group.iter().any(|p| scope.contains(p)))
                .cloned()
                .collect(),
            self_imports: self
                .self_imports
                .iter()
                .filter(|p| scope.contains(p))
                .cloned()
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileNode {
    pub path: String,
    pub centrality: f64,
    pub fan_in: usize,
    pub fan_out: usize,
}

/// Scoped, serializable view of the graph.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GraphView {
    pub generation: u64,
    pub nodes: Vec<FileNode>,
    pub edges: Vec<GraphEdge>,
    pub symbol_edges: Vec<SymbolEdge>,
    pub unresolved: Vec<UnresolvedImport>,
    pub cycles: Vec<Vec<String>>,
    pub self_imports: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::filesystem::compute_content_hash;
    use crate::indexer::parser::parse;
    use crate::models::{FileRecord, ParseStatus, Technology};
    use crate::store::index::{IndexChange, ProjectIndex};

    fn change(path: &str, src: &str) -> IndexChange {
        let tech = Technology::Python;
        let unit = parse(path, src, tech).unwrap();
        IndexChange::Upsert(
            FileRecord {
                path: path.to_string(),
                technology: tech,
                fingerprint: compute_content_hash(src.as_bytes()),
                content_hash: compute_content_hash(src.as_bytes()),
                size_bytes: src.len() as u64,
                mtime_ns: 0,
                line_count: src.lines().count(),
                status: ParseStatus::Parsed,
            },
            unit,
        )
    }

    fn cyclic_index() -> ProjectIndex {
        let index = ProjectIndex::new();
        index.commit(vec![
            change("a.py", "import b\n\ndef fa():\n    b.fb()\n"),
            change("b.py", "import c\n\ndef fb():\n    c.fc()\n"),
            change("c.py", "import a\n\ndef fc():\n    return 1\n"),
        ]);
        index
    }

    #[test]
    fn test_cycle_detected() {
        let index = cyclic_index();
        let graph = build(&index.snapshot());
        assert_eq!(graph.cycles, vec![vec!["a.py", "b.py", "c.py"]]);
        assert!(graph.in_cycle("b.py"));
        assert!(graph.unresolved.is_empty());
    }

    #[test]
    fn test_unrelated_file_leaves_cycles_unchanged() {
        let index = cyclic_index();
        let before = build(&index.snapshot()).cycles;
        index.commit(vec![change("d.py", "import os\n\nx = 1\n")]);
        let graph = build(&index.snapshot());
        assert_eq!(graph.cycles, before);
        assert_eq!(graph.unresolved.len(), 1);
        assert!(graph.unresolved[0].is_external());
    }

    #[test]
    fn test_reference_edges() {
        let index = ProjectIndex::new();
        index.commit(vec![
            change("lib.py", "def helper():\n    return 1\n"),
            change("app.py", "from lib import helper\n\ndef main():\n    helper()\n"),
        ]);
        let graph = build(&index.snapshot());
        assert!(graph
            .file_edges
            .iter()
            .any(|e| e.source == "app.py" && e.target == "lib.py" && e.kind == EdgeKind::Calls));
        assert!(graph.symbol_edges.iter().any(|e| {
            e.source == SymbolId::new("app.py", "app.main")
                && e.target == SymbolId::new("lib.py", "lib.helper")
        }));
        assert_eq!(graph.dependents_of("lib.py"), BTreeSet::from(["app.py".to_string()]));
        let helper = SymbolId::new("lib.py", "lib.helper");
        assert_eq!(graph.references_to(&helper).count(), 1);
    }

    #[test]
    fn test_self_import_not_a_cycle() {
        let index = ProjectIndex::new();
        index.commit(vec![change("a.py", "import a\n")]);
        let graph = build(&index.snapshot());
        assert!(graph.cycles.is_empty());
        assert_eq!(graph.self_imports, vec!["a.py"]);
    }

    #[test]
    fn test_incremental_matches_full_build() {
        let index = cyclic_index();
        let old = index.snapshot();
        let previous = build(&old);
        index.commit(vec![
            change("c.py", "def fc():\n    return 2\n"),
            change("e.py", "import a\n\ndef fe():\n    a.fa()\n"),
            IndexChange::Remove("b.py".to_string()),
        ]);
        let new = index.snapshot();
        let changed = new.changed_since(&old);
        let incremental = update(&previous, &new, &changed);
        assert_eq!(incremental, build(&new));
    }

    #[test]
    fn test_transitive_dependents_bounded() {
        let index = ProjectIndex::new();
        index.commit(vec![
            change("a.py", "x = 1\n"),
            change("b.py", "import a\n"),
            change("c.py", "import b\n"),
            change("d.py", "import c\n"),
        ]);
        let graph = build(&index.snapshot());
        let seeds = BTreeSet::from(["a.py".to_string()]);
        let reached = graph.transitive_dependents(&seeds, 2);
        assert_eq!(reached.get("b.py"), Some(&1));
        assert_eq!(reached.get("c.py"), Some(&2));
        assert!(!reached.contains_key("d.py"));
    }

    #[test]
    fn test_view_scope_filters() {
        let index = cyclic_index();
        let graph = build(&index.snapshot());
        let view = graph.view(&Scope::paths(["a.py"]));
        assert_eq!(view.nodes.len(), 1);
        assert!(view.edges.iter().all(|e| e.source == "a.py"));
        assert_eq!(view.cycles.len(), 1);
    }
}
