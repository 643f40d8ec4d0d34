//! Symbol lookup: every declaration of a name and each site referring to it.

use serde::Serialize;

use crate::errors::{RefractError, RefractResult};
use crate::indexer::graph::DependencyGraph;
use crate::models::{DeclarationKind, ReferenceKind, Scope, Span, SymbolId};
use crate::store::index::IndexSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceContext {
    Definition,
    Import,
    Call,
    Inherit,
    Use,
}

impl From<ReferenceKind> for ReferenceContext {
    fn from(kind: ReferenceKind) -> Self {
        match kind {
            ReferenceKind::Call => ReferenceContext::Call,
            ReferenceKind::Inherit => ReferenceContext::Inherit,
            ReferenceKind::Use => ReferenceContext::Use,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReferenceLocation {
    pub path: String,
    pub span: Span,
    pub context: ReferenceContext,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SymbolReferences {
    pub symbol: SymbolId,
    pub kind: DeclarationKind,
    /// Definition first, then every other site in path and offset order.
    pub locations: Vec<ReferenceLocation>,
    /// Sites other than the definition.
    pub usage_count: usize,
}

/// Import-list entries naming `name` in files whose import resolved to the
/// file declaring `symbol`.
pub fn import_sites(
    snapshot: &IndexSnapshot,
    graph: &DependencyGraph,
    symbol: &SymbolId,
    name: &str,
) -> Vec<(String, Span)> {
    let mut sites = Vec::new();
    for (path, contribution) in &graph.per_file {
        let Some(file) = snapshot.get(path) else {
            continue;
        };
        for (resolved, import) in contribution.imports.iter().zip(&file.unit.imports) {
            if !resolved.targets.iter().any(|t| *t == symbol.path) {
                continue;
            }
            for imported in import.names.iter().filter(|n| n.name == name) {
                sites.push((path.clone(), imported.span));
            }
        }
    }
    sites
}

/// References of every symbol called `name` (simple or qualified),
/// optionally narrowed to declarations under `path`.
pub fn find_references(
    snapshot: &IndexSnapshot,
    graph: &DependencyGraph,
    name: &str,
    path: Option<&str>,
) -> RefractResult<Vec<SymbolReferences>> {
    let filter = path.map(|p| Scope::paths([p]));
    let declarations: Vec<_> = snapshot
        .declarations_named(name)
        .into_iter()
        .filter(|(id, _)| filter.as_ref().map_or(true, |s| s.contains(&id.path)))
        .collect();
    if declarations.is_empty() {
        let place = path.map(|p| format!(" in {p}")).unwrap_or_default();
        return Err(RefractError::UnresolvedTarget(format!(
            "no symbol `{name}`{place}"
        )));
    }

    let mut out = Vec::with_capacity(declarations.len());
    for (id, decl) in declarations {
        let mut sites: Vec<ReferenceLocation> = graph
            .references_to(&id)
            .map(|(p, r)| ReferenceLocation {
                path: p.clone(),
                span: r.span,
                context: r.kind.into(),
            })
            .collect();
        sites.extend(
            import_sites(snapshot, graph, &id, &decl.name)
                .into_iter()
                .map(|(p, span)| ReferenceLocation {
                    path: p,
                    span,
                    context: ReferenceContext::Import,
                }),
        );
        sites.sort_by(|a, b| a.path.cmp(&b.path).then(a.span.start.cmp(&b.span.start)));
        sites.dedup_by(|a, b| a.path == b.path && a.span == b.span);

        let usage_count = sites.len();
        let mut locations = Vec::with_capacity(usage_count + 1);
        locations.push(ReferenceLocation {
            path: id.path.clone(),
            span: decl.name_span,
            context: ReferenceContext::Definition,
        });
        locations.extend(sites);
        out.push(SymbolReferences {
            symbol: id,
            kind: decl.kind,
            locations,
            usage_count,
        });
    }
    Ok(out)
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

    const LIB: &str = "def helper(x):\n    return x + 1\n";
    const APP: &str = "from lib import helper\n\ndef main():\n    return helper(2)\n";

    #[test]
    fn test_definition_import_and_call() {
        let index = index_of(&[("lib.py", LIB), ("app.py", APP)]);
        let snap = index.snapshot();
        let found = find_references(&snap, &build(&snap), "helper", None).unwrap();
        assert_eq!(found.len(), 1);
        let refs = &found[0];
        assert_eq!(refs.symbol, SymbolId::new("lib.py", "lib.helper"));
        assert_eq!(refs.kind, DeclarationKind::Function);
        assert_eq!(refs.usage_count, 2);
        let contexts: Vec<(&str, usize, ReferenceContext)> = refs
            .locations
            .iter()
            .map(|l| (l.path.as_str(), l.span.start_line, l.context))
            .collect();
        assert_eq!(
            contexts,
            vec![
                ("lib.py", 1, ReferenceContext::Definition),
                ("app.py", 1, ReferenceContext::Import),
                ("app.py", 4, ReferenceContext::Call),
            ]
        );
    }

    #[test]
    fn test_narrowed_by_path_and_missing_name() {
        let other = "def helper():\n    pass\n";
        let index = index_of(&[("lib.py", LIB), ("app.py", APP), ("other.py", other)]);
        let snap = index.snapshot();
        let graph = build(&snap);

        assert_eq!(find_references(&snap, &graph, "helper", None).unwrap().len(), 2);
        let narrowed = find_references(&snap, &graph, "helper", Some("other.py")).unwrap();
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].usage_count, 0);

        let err = find_references(&snap, &graph, "absent", None).unwrap_err();
        assert!(matches!(err, RefractError::UnresolvedTarget(ref m) if m.contains("absent")));
    }
}
