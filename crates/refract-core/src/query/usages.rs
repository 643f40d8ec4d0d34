//! Literal text usages across the project, outside comments and string
//! literals, with the impact of touching the files they live in.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{RefractError, RefractResult};
use crate::indexer::filesystem::compute_content_hash;
use crate::indexer::graph::DependencyGraph;
use crate::indexer::symbols::mask_source;
use crate::models::{LineIndex, ReferenceKind, Scope, Span, StructuralUnit, Technology};
use crate::query::guards::MAX_PATTERN_LENGTH;
use crate::refactor::fs::SourceReader;
use crate::refactor::plan::{risk_level, RiskLevel};
use crate::store::index::IndexSnapshot;

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Rejects empty and oversized search text.
pub fn validate_pattern(text: &str) -> Result<(), String> {
    if text.is_empty() {
        return Err("pattern text is empty".to_string());
    }
    if text.len() > MAX_PATTERN_LENGTH {
        return Err(format!(
            "pattern text is {} bytes, the limit is {MAX_PATTERN_LENGTH}",
            text.len()
        ));
    }
    Ok(())
}

/// Non-overlapping occurrences of `text` in code. Comments and string
/// literal contents never match. When `text` starts or ends with an
/// identifier character, the neighbouring byte must not be one, so `helper`
/// does not match inside `helpers`.
pub fn occurrences(content: &str, technology: Technology, text: &str) -> Vec<Span> {
    if text.is_empty() {
        return Vec::new();
    }
    let masked = mask_source(content, technology);
    let bytes = content.as_bytes();
    let pattern = text.as_bytes();
    let guard_start = is_ident_byte(pattern[0]);
    let guard_end = is_ident_byte(pattern[pattern.len() - 1]);
    let lines = LineIndex::new(content);

    let mut out = Vec::new();
    for (start, _) in masked.match_indices(text) {
        let end = start + text.len();
        if content.get(start..end) != Some(text) {
            continue;
        }
        if guard_start && start > 0 && is_ident_byte(bytes[start - 1]) {
            continue;
        }
        if guard_end && bytes.get(end).copied().is_some_and(is_ident_byte) {
            continue;
        }
        out.push(lines.span(start, end));
    }
    out
}

// ---------------------------------------------------------------------------
// Usage report
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    Declaration,
    Import,
    Call,
    Inherit,
    Use,
    Code,
}

impl From<ReferenceKind> for UsageKind {
    fn from(kind: ReferenceKind) -> Self {
        match kind {
            ReferenceKind::Call => UsageKind::Call,
            ReferenceKind::Inherit => UsageKind::Inherit,
            ReferenceKind::Use => UsageKind::Use,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub path: String,
    pub span: Span,
    pub kind: UsageKind,
    /// The source line, trimmed.
    pub line: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UsageReport {
    pub generation: u64,
    pub text: String,
    pub usages: Vec<Usage>,
    pub files: Vec<String>,
    /// Files importing any of `files`, excluding those files.
    pub dependents: Vec<String>,
    pub transitive_dependents: Vec<String>,
    pub risk: RiskLevel,
    /// Files whose content no longer matches the index; not searched.
    pub stale: Vec<String>,
}

/// What the structure of `unit` says about the occurrence at `span`.
fn classify(unit: &StructuralUnit, span: Span) -> UsageKind {
    if unit.all_declarations().iter().any(|d| d.name_span == span) {
        return UsageKind::Declaration;
    }
    if unit
        .imports
        .iter()
        .any(|i| i.names.iter().any(|n| n.span == span))
    {
        return UsageKind::Import;
    }
    unit.references
        .iter()
        .find(|r| r.span == span)
        .map(|r| r.kind.into())
        .unwrap_or(UsageKind::Code)
}

/// Every usage of `text` in the files of `scope`, read through `reader`.
pub fn find_usages(
    snapshot: &IndexSnapshot,
    graph: &DependencyGraph,
    reader: &dyn SourceReader,
    text: &str,
    scope: &Scope,
    max_depth: usize,
) -> RefractResult<UsageReport> {
    validate_pattern(text).map_err(RefractError::Query)?;

    let mut usages = Vec::new();
    let mut files = BTreeSet::new();
    let mut stale = Vec::new();
    for (path, file) in snapshot.files_in(scope) {
        let content = match reader.read(path) {
            Ok(content) if compute_content_hash(content.as_bytes()) == file.record.content_hash => {
                content
            }
            Ok(_) => {
                stale.push(path.clone());
                continue;
            }
            Err(err) => {
                warn!(path = %path, error = %err, "usage search skipped unreadable file");
                stale.push(path.clone());
                continue;
            }
        };
        let found = occurrences(&content, file.record.technology, text);
        if found.is_empty() {
            continue;
        }
        files.insert(path.clone());
        let lines: Vec<&str> = content.lines().collect();
        for span in found {
            usages.push(Usage {
                path: path.clone(),
                span,
                kind: classify(&file.unit, span),
                line: lines
                    .get(span.start_line.saturating_sub(1))
                    .map(|l| l.trim().to_string())
                    .unwrap_or_default(),
            });
        }
    }

    let mut dependents: BTreeSet<String> = files
        .iter()
        .flat_map(|p| graph.dependents_of(p))
        .collect();
    dependents.retain(|p| !files.contains(p));
    let mut seeds = dependents.clone();
    seeds.extend(files.iter().cloned());
    let transitive: Vec<String> = graph
        .transitive_dependents(&seeds, max_depth)
        .into_keys()
        .collect();
    let risk = risk_level(dependents.len(), transitive.len(), 0);

    debug!(
        text,
        usages = usages.len(),
        files = files.len(),
        stale = stale.len(),
        "usage search finished"
    );
    Ok(UsageReport {
        generation: snapshot.generation(),
        text: text.to_string(),
        usages,
        files: files.into_iter().collect(),
        dependents: dependents.into_iter().collect(),
        transitive_dependents: transitive,
        risk,
        stale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::graph::build;
    use crate::indexer::parser::parse;
    use crate::models::{FileRecord, ParseStatus};
    use crate::store::index::{IndexChange, ProjectIndex};
    use std::collections::HashMap;

    struct MemReader(HashMap<String, String>);

    impl SourceReader for MemReader {
        fn read(&self, path: &str) -> RefractResult<String> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| RefractError::PathNotFound(path.into()))
        }
    }

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
    fn test_occurrences_skip_comments_strings_and_longer_names() {
        let src = "# helper here\nx = helper(1)\ny = \"helper\"\nhelpers = helper\n";
        let found = occurrences(src, Technology::Python, "helper");
        let starts: Vec<usize> = found.iter().map(|s| s.start).collect();
        let first = src.find("helper(").unwrap();
        let last = src.rfind("helper").unwrap();
        assert_eq!(starts, vec![first, last]);
        assert_eq!(found[0].start_line, 2);
        assert_eq!(found[1].start_line, 4);
    }

    #[test]
    fn test_occurrences_of_punctuated_text() {
        let src = "a = b + 1\nc = b + 10\n";
        assert_eq!(occurrences(src, Technology::Python, "b +").len(), 2);
        let found = occurrences(src, Technology::Python, "+ 1");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start_line, 1);
        assert!(occurrences(src, Technology::Python, "").is_empty());
    }

    #[test]
    fn test_usages_classified_with_impact() {
        let lib = "def helper(x):\n    return x + 1\n";
        let app = "from lib import helper\n\ndef main():\n    # helper\n    return helper(2)\n";
        let cli = "import app\n";
        let files = [("lib.py", lib), ("app.py", app), ("cli.py", cli)];
        let index = index_of(&files);
        let snap = index.snapshot();
        let graph = build(&snap);
        let reader = MemReader(
            files
                .iter()
                .map(|(p, s)| (p.to_string(), s.to_string()))
                .collect(),
        );

        let report = find_usages(&snap, &graph, &reader, "helper", &Scope::all(), 4).unwrap();
        let kinds: Vec<(&str, UsageKind)> = report
            .usages
            .iter()
            .map(|u| (u.path.as_str(), u.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("app.py", UsageKind::Import),
                ("app.py", UsageKind::Call),
                ("lib.py", UsageKind::Declaration),
            ]
        );
        assert_eq!(report.usages[1].line, "return helper(2)");
        assert_eq!(report.files, vec!["app.py", "lib.py"]);
        assert_eq!(report.dependents, vec!["cli.py"]);
        assert!(report.stale.is_empty());
    }

    #[test]
    fn test_usages_report_stale_files_and_reject_empty_text() {
        let src = "def helper():\n    pass\n";
        let index = index_of(&[("lib.py", src)]);
        let snap = index.snapshot();
        let graph = build(&snap);
        let mut changed = HashMap::new();
        changed.insert("lib.py".to_string(), "def helper():\n    return 1\n".to_string());
        let reader = MemReader(changed);

        let report = find_usages(&snap, &graph, &reader, "helper", &Scope::all(), 4).unwrap();
        assert!(report.usages.is_empty());
        assert_eq!(report.stale, vec!["lib.py"]);

        let err = find_usages(&snap, &graph, &reader, "", &Scope::all(), 4).unwrap_err();
        assert!(matches!(err, RefractError::Query(_)));
    }
}
