//! Per-file dependency report: what a file imports, what it depends on,
//! who depends on it and the import cycles it sits in.

use std::path::PathBuf;

use serde::Serialize;

use crate::errors::{RefractError, RefractResult};
use crate::indexer::graph::DependencyGraph;
use crate::indexer::imports::UnresolvedReason;
use crate::store::index::IndexSnapshot;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImportEntry {
    pub module: String,
    pub line: usize,
    /// Names listed by a `from`-style import; empty for whole-module imports.
    pub names: Vec<String>,
    pub targets: Vec<String>,
    pub unresolved: Option<UnresolvedReason>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileDependencies {
    pub generation: u64,
    pub path: String,
    pub imports: Vec<ImportEntry>,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    /// Cycle groups containing this file.
    pub cycles: Vec<Vec<String>>,
    pub self_import: bool,
    pub centrality: f64,
}

pub fn file_dependencies(
    snapshot: &IndexSnapshot,
    graph: &DependencyGraph,
    path: &str,
) -> RefractResult<FileDependencies> {
    let file = snapshot
        .get(path)
        .ok_or_else(|| RefractError::PathNotFound(PathBuf::from(path)))?;
    let resolved = graph.per_file.get(path).map(|c| c.imports.as_slice()).unwrap_or(&[]);

    let imports = file
        .unit
        .imports
        .iter()
        .enumerate()
        .map(|(i, edge)| {
            let resolution = resolved.get(i);
            ImportEntry {
                module: edge.module.clone(),
                line: edge.span.start_line,
                names: edge.names.iter().map(|n| n.name.clone()).collect(),
                targets: resolution.map(|r| r.targets.clone()).unwrap_or_default(),
                unresolved: resolution.and_then(|r| r.unresolved.clone()),
            }
        })
        .collect();

    Ok(FileDependencies {
        generation: snapshot.generation(),
        path: path.to_string(),
        imports,
        dependencies: graph.dependencies_of(path).into_iter().collect(),
        dependents: graph.dependents_of(path).into_iter().collect(),
        cycles: graph
            .cycles
            .iter()
            .filter(|group| group.iter().any(|p| p == path))
            .cloned()
            .collect(),
        self_import: graph.self_imports.iter().any(|p| p == path),
        centrality: graph.centrality.get(path).copied().unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::filesystem::compute_content_hash;
    use crate::indexer::graph::build;
    use crate::indexer::parser::parse;
    use crate::models::{FileRecord, ParseStatus, Technology};
    use crate::store::index::{IndexChange, ProjectIndex};

    fn index_of(files: &[(&str, &str)]) -> ProjectIndex {
        let index = ProjectIndex::new();
        let changes = files
            .iter()
            .map(|(path, src)| {
                IndexChange::Upsert(
                    FileRecord {
                        path: path.to_string(),
                        technology: Technology::Python,
                        fingerprint: String::new(),
                        content_hash: compute_content_hash(src.as_bytes()),
                        size_bytes: src.len() as u64,
                        mtime_ns: 0,
                        line_count: src.lines().count(),
                        status: ParseStatus::Parsed,
                    },
                    parse(path, src, Technology::Python).unwrap(),
                )
            })
            .collect();
        index.commit(changes);
        index
    }

    #[test]
    fn test_imports_dependents_and_cycle() {
        let index = index_of(&[
            ("a.py", "import b\nfrom c import run\nimport os\n"),
            ("b.py", "import a\n"),
            ("c.py", "def run():\n    pass\n"),
            ("d.py", "import a\n"),
        ]);
        let snap = index.snapshot();
        let graph = build(&snap);
        let deps = file_dependencies(&snap, &graph, "a.py").unwrap();

        let modules: Vec<&str> = deps.imports.iter().map(|i| i.module.as_str()).collect();
        assert_eq!(modules, vec!["b", "c", "os"]);
        assert_eq!(deps.imports[1].names, vec!["run"]);
        assert_eq!(deps.imports[1].targets, vec!["c.py"]);
        assert_eq!(deps.imports[2].unresolved, Some(UnresolvedReason::External));
        assert_eq!(deps.dependencies, vec!["b.py", "c.py"]);
        assert_eq!(deps.dependents, vec!["b.py", "d.py"]);
        assert_eq!(deps.cycles, vec![vec!["a.py".to_string(), "b.py".to_string()]]);
        assert!(!deps.self_import);
        assert!(deps.centrality > 0.0);

        let leaf = file_dependencies(&snap, &graph, "c.py").unwrap();
        assert!(leaf.imports.is_empty());
        assert!(leaf.cycles.is_empty());
        assert_eq!(leaf.dependents, vec!["a.py"]);
    }

    #[test]
    fn test_unindexed_file_is_not_found() {
        let index = index_of(&[("a.py", "x = 1\n")]);
        let snap = index.snapshot();
        let err = file_dependencies(&snap, &build(&snap), "missing.py").unwrap_err();
        assert!(matches!(err, RefractError::PathNotFound(_)));
    }
}
