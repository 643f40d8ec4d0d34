//! Refactoring suggestions derived from pattern matches and quality issues.
//!
//! Each code smell or anti-pattern maps to one kind of refactoring. A
//! pattern match and a quality issue at the same place and of the same kind
//! are merged into one suggestion listing both sources. Where the finding
//! has a precise range, the suggestion carries a section target that can be
//! handed straight to the planner.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::query::patterns::{PatternCategory, PatternMatch, PatternReport};
use crate::query::quality::QualityReport;
use crate::refactor::plan::RefactorTarget;

/// Confidence given to quality issues, which carry none of their own.
pub const QUALITY_ISSUE_CONFIDENCE: f64 = 0.6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    Rename,
    ExtractFunction,
    SplitClass,
    BreakCycle,
    SplitModule,
    FixImport,
}

impl SuggestionKind {
    fn for_pattern(pattern_id: &str) -> Option<Self> {
        match pattern_id {
            "naming_convention" => Some(SuggestionKind::Rename),
            "long_function" | "complex_function" | "deep_nesting" => {
                Some(SuggestionKind::ExtractFunction)
            }
            "god_class" => Some(SuggestionKind::SplitClass),
            "circular_dependency" => Some(SuggestionKind::BreakCycle),
            "hub_module" => Some(SuggestionKind::SplitModule),
            "unresolved_import" => Some(SuggestionKind::FixImport),
            _ => None,
        }
    }

    fn for_issue(kind: &str) -> Option<Self> {
        match kind {
            "long_function" => Some(SuggestionKind::ExtractFunction),
            "complex_class" => Some(SuggestionKind::SplitClass),
            _ => None,
        }
    }

    fn advice(self) -> &'static str {
        match self {
            SuggestionKind::Rename => "Rename to follow the naming convention",
            SuggestionKind::ExtractFunction => {
                "Extract parts of the body into smaller functions"
            }
            SuggestionKind::SplitClass => "Split the class into smaller, focused classes",
            SuggestionKind::BreakCycle => {
                "Break the import cycle by moving shared code into a separate module"
            }
            SuggestionKind::SplitModule => "Split the module so dependents import less",
            SuggestionKind::FixImport => "Point the import at an indexed module",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub path: String,
    pub line: usize,
    pub description: String,
    /// Finding messages that led here.
    pub reasons: Vec<String>,
    /// Pattern ids and quality issue kinds, sorted.
    pub sources: Vec<String>,
    pub confidence: f64,
    /// Planner target for the finding's range, when it has one.
    pub target: Option<RefactorTarget>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SuggestionReport {
    pub generation: u64,
    pub suggestions: Vec<Suggestion>,
}

fn section_of(m: &PatternMatch) -> Option<RefactorTarget> {
    let location = m.locations.first()?;
    if location.span.is_empty() {
        return None;
    }
    Some(RefactorTarget::Section {
        path: location.path.clone(),
        start: location.span.start,
        end: location.span.end,
    })
}

type Key = (String, usize, SuggestionKind);

fn merge(
    found: &mut BTreeMap<Key, Suggestion>,
    key: Key,
    source: &str,
    reason: String,
    confidence: f64,
    target: Option<RefactorTarget>,
) {
    let entry = found.entry(key.clone()).or_insert_with(|| Suggestion {
        kind: key.2,
        path: key.0.clone(),
        line: key.1,
        description: key.2.advice().to_string(),
        reasons: Vec::new(),
        sources: Vec::new(),
        confidence,
        target: None,
    });
    if !entry.sources.iter().any(|s| s == source) {
        entry.sources.push(source.to_string());
        entry.sources.sort();
    }
    if !entry.reasons.contains(&reason) {
        entry.reasons.push(reason);
    }
    entry.confidence = entry.confidence.max(confidence);
    if entry.target.is_none() {
        entry.target = target;
    }
}

/// Suggestions for every smell and anti-pattern in `patterns` and every
/// issue in `quality`, ordered by path, line and kind.
pub fn suggest_refactorings(patterns: &PatternReport, quality: &QualityReport) -> SuggestionReport {
    let mut found: BTreeMap<Key, Suggestion> = BTreeMap::new();

    for m in &patterns.matches {
        if m.category == PatternCategory::DesignPattern {
            continue;
        }
        let (Some(kind), Some(location)) = (SuggestionKind::for_pattern(&m.pattern_id), m.locations.first())
        else {
            continue;
        };
        merge(
            &mut found,
            (location.path.clone(), location.span.start_line, kind),
            &m.pattern_id,
            m.message.clone(),
            m.confidence,
            section_of(m),
        );
    }

    for file in &quality.files {
        for issue in &file.issues {
            let Some(kind) = SuggestionKind::for_issue(&issue.kind) else {
                continue;
            };
            merge(
                &mut found,
                (file.path.clone(), issue.line, kind),
                &issue.kind,
                issue.message.clone(),
                QUALITY_ISSUE_CONFIDENCE,
                None,
            );
        }
    }

    SuggestionReport {
        generation: patterns.generation.max(quality.generation),
        suggestions: found.into_values().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Span, Technology};
    use crate::query::patterns::Location;
    use crate::query::quality::{FileMetrics, QualityIssue};

    fn matched(id: &str, category: PatternCategory, path: &str, span: Span, confidence: f64) -> PatternMatch {
        PatternMatch {
            pattern_id: id.to_string(),
            category,
            locations: vec![Location {
                path: path.to_string(),
                span,
            }],
            confidence,
            message: format!("{id} found"),
        }
    }

    fn metrics(path: &str, issues: Vec<QualityIssue>) -> FileMetrics {
        FileMetrics {
            path: path.to_string(),
            technology: Technology::Python,
            lines: 100,
            complexity: 1,
            max_nesting: 0,
            maintainability: 80.0,
            parse_failed: false,
            declarations: vec![],
            issues,
        }
    }

    #[test]
    fn test_smells_map_to_refactorings() {
        let patterns = PatternReport {
            generation: 3,
            matches: vec![
                matched("singleton", PatternCategory::DesignPattern, "a.py", Span::new(0, 40, 1, 4), 0.9),
                matched("naming_convention", PatternCategory::CodeSmell, "a.py", Span::new(6, 11, 1, 1), 0.8),
                matched("circular_dependency", PatternCategory::AntiPattern, "b.py", Span::new(0, 0, 2, 2), 1.0),
            ],
            errors: vec![],
        };
        let report = suggest_refactorings(&patterns, &QualityReport::default());
        assert_eq!(report.generation, 3);
        let kinds: Vec<SuggestionKind> = report.suggestions.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SuggestionKind::Rename, SuggestionKind::BreakCycle]);

        let rename = &report.suggestions[0];
        assert_eq!(
            rename.target,
            Some(RefactorTarget::Section {
                path: "a.py".to_string(),
                start: 6,
                end: 11,
            })
        );
        assert_eq!(report.suggestions[1].target, None);
        assert_eq!(report.suggestions[1].line, 2);
    }

    #[test]
    fn test_pattern_and_quality_issue_merge() {
        let patterns = PatternReport {
            generation: 1,
            matches: vec![matched(
                "long_function",
                PatternCategory::CodeSmell,
                "a.py",
                Span::new(0, 900, 3, 70),
                0.7,
            )],
            errors: vec![],
        };
        let quality = QualityReport {
            generation: 1,
            files: vec![metrics(
                "a.py",
                vec![
                    QualityIssue {
                        kind: "long_function".to_string(),
                        line: 3,
                        message: "Function f is too long (68 lines)".to_string(),
                        suggestion: String::new(),
                    },
                    QualityIssue {
                        kind: "complex_class".to_string(),
                        line: 80,
                        message: "Class C has too many methods (12)".to_string(),
                        suggestion: String::new(),
                    },
                ],
            )],
            ..QualityReport::default()
        };
        let report = suggest_refactorings(&patterns, &quality);
        assert_eq!(report.suggestions.len(), 2);

        let extract = &report.suggestions[0];
        assert_eq!(extract.kind, SuggestionKind::ExtractFunction);
        assert_eq!(extract.sources, vec!["long_function"]);
        assert_eq!(extract.reasons.len(), 2);
        assert_eq!(extract.confidence, 0.7);
        assert!(extract.target.is_some());

        let split = &report.suggestions[1];
        assert_eq!(split.kind, SuggestionKind::SplitClass);
        assert_eq!(split.confidence, QUALITY_ISSUE_CONFIDENCE);
        assert_eq!(split.target, None);
    }
}
