//! Reference resolution from extracted reference sites to declarations.
//!
//! Resolution is cascading: same-file declarations first, then declarations
//! in files this file imports (resolved imports only). Within a step,
//! candidates are ranked by lexical scope; a tie at the top is ambiguous and
//! leaves the reference unresolved.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{Declaration, ReferenceKind, Span, StructuralUnit, SymbolId};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A reference site together with what it resolved to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedReference {
    pub name: String,
    pub span: Span,
    pub kind: ReferenceKind,
    /// Enclosing declaration, `None` at file level.
    pub source: Option<SymbolId>,
    pub target: Option<SymbolId>,
}

/// One named declaration with the scope it lives in.
#[derive(Debug, Clone, Copy)]
pub struct SymbolEntry<'a> {
    pub declaration: &'a Declaration,
    pub depth: usize,
}

/// Symbol declarations of one file, by simple name.
#[derive(Debug, Default)]
pub struct FileSymbols<'a> {
    by_name: HashMap<&'a str, Vec<SymbolEntry<'a>>>,
}

impl<'a> FileSymbols<'a> {
    pub fn new(unit: &'a StructuralUnit) -> Self {
        let mut by_name: HashMap<&'a str, Vec<SymbolEntry<'a>>> = HashMap::new();
        let mut stack: Vec<(&'a Declaration, usize)> =
            unit.declarations.iter().rev().map(|d| (d, 0)).collect();
        while let Some((decl, depth)) = stack.pop() {
            if decl.kind.is_symbol() {
                by_name.entry(decl.name.as_str()).or_default().push(SymbolEntry {
                    declaration: decl,
                    depth,
                });
            }
            for child in decl.children.iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        Self { by_name }
    }

    pub fn named(&self, name: &str) -> &[SymbolEntry<'a>] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Scope ranking
// ---------------------------------------------------------------------------

/// Qualified name of the scope a declaration is declared in.
fn declared_scope(decl: &Declaration) -> &str {
    let qualified = decl.qualified_name.as_str();
    let base = match qualified.rfind('#') {
        Some(hash) if qualified[hash + 1..].bytes().all(|b| b.is_ascii_digit()) => {
            &qualified[..hash]
        }
        _ => qualified,
    };
    base.strip_suffix(decl.name.as_str())
        .unwrap_or(base)
        .trim_end_matches(['.', ':'])
}

fn scope_encloses(scope: &str, enclosing: &str) -> bool {
    if scope.is_empty() {
        return true;
    }
    enclosing.starts_with(scope)
        && matches!(enclosing.as_bytes().get(scope.len()), None | Some(b'.') | Some(b':'))
}

/// Higher is closer. Declarations whose scope encloses the reference rank
/// by scope length; the rest rank by shallowness.
fn rank(entry: &SymbolEntry<'_>, enclosing: Option<&str>) -> i64 {
    let scope = declared_scope(entry.declaration);
    match enclosing {
        Some(enclosing) if scope_encloses(scope, enclosing) => scope.len() as i64,
        _ => -(entry.depth as i64) - 1,
    }
}

/// Pick the unique best-ranked candidate, if there is one.
fn pick<'a>(
    candidates: &[(String, SymbolEntry<'a>)],
    enclosing: Option<&str>,
) -> Option<SymbolId> {
    let best = candidates
        .iter()
        .map(|(_, entry)| rank(entry, enclosing))
        .max()?;
    let mut top = candidates
        .iter()
        .filter(|(_, entry)| rank(entry, enclosing) == best);
    let (path, entry) = top.next()?;
    if top.next().is_some() {
        return None;
    }
    Some(SymbolId::new(path.clone(), entry.declaration.qualified_name.clone()))
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Resolve every reference site of `path`.
///
/// `imported` lists the files this file's resolved imports point at;
/// `tables` holds the symbol tables of every indexed file.
pub fn resolve_references(
    path: &str,
    unit: &StructuralUnit,
    imported: &[String],
    tables: &HashMap<&str, FileSymbols<'_>>,
) -> Vec<ResolvedReference> {
    let own = tables.get(path);
    unit.references
        .iter()
        .map(|site| {
            let enclosing = site.enclosing.as_deref();
            let same_file: Vec<(String, SymbolEntry<'_>)> = own
                .map(|t| t.named(&site.name))
                .unwrap_or(&[])
                .iter()
                .map(|e| (path.to_string(), *e))
                .collect();
            let target = if !same_file.is_empty() {
                pick(&same_file, enclosing)
            } else {
                let imported_candidates: Vec<(String, SymbolEntry<'_>)> = imported
                    .iter()
                    .filter(|target| target.as_str() != path)
                    .filter_map(|target| tables.get(target.as_str()).map(|t| (target, t)))
                    .flat_map(|(target, t)| {
                        t.named(&site.name).iter().map(move |e| (target.clone(), *e))
                    })
                    .collect();
                pick(&imported_candidates, None)
            };
            ResolvedReference {
                name: site.name.clone(),
                span: site.span,
                kind: site.kind,
                source: site
                    .enclosing
                    .as_ref()
                    .map(|q| SymbolId::new(path, q.clone())),
                target,
            }
        })
        .collect()
}
