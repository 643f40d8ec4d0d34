//! Structural pattern and anti-pattern detection.
//!
//! Rules form a closed enum evaluated per file against one snapshot and its
//! graph. Every (rule, file) evaluation is isolated: an error or a panic is
//! reported as a [`RuleError`] and the remaining rules still run.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{RefractError, RefractResult};
use crate::indexer::graph::DependencyGraph;
use crate::indexer::imports::UnresolvedReason;
use crate::models::{Declaration, DeclarationKind, Scope, Span, Technology};
use crate::store::index::{IndexSnapshot, IndexedFile};

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Rule {
    Singleton,
    Factory,
    GodClass {
        max_methods: usize,
    },
    LongFunction {
        max_lines: usize,
    },
    ComplexFunction {
        max_complexity: u32,
    },
    DeepNesting {
        max_depth: u32,
    },
    CircularDependency,
    HubModule {
        min_dependents: usize,
    },
    UnresolvedImport,
    NamingConvention {
        kind: DeclarationKind,
        pattern: String,
        /// Empty means every technology.
        #[serde(default)]
        technologies: Vec<Technology>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    DesignPattern,
    AntiPattern,
    CodeSmell,
}

impl Rule {
    pub fn id(&self) -> &'static str {
        match self {
            Rule::Singleton => "singleton",
            Rule::Factory => "factory",
            Rule::GodClass { .. } => "god_class",
            Rule::LongFunction { .. } => "long_function",
            Rule::ComplexFunction { .. } => "complex_function",
            Rule::DeepNesting { .. } => "deep_nesting",
            Rule::CircularDependency => "circular_dependency",
            Rule::HubModule { .. } => "hub_module",
            Rule::UnresolvedImport => "unresolved_import",
            Rule::NamingConvention { .. } => "naming_convention",
        }
    }

    pub fn category(&self) -> PatternCategory {
        match self {
            Rule::Singleton | Rule::Factory => PatternCategory::DesignPattern,
            Rule::GodClass { .. } | Rule::CircularDependency | Rule::HubModule { .. } => {
                PatternCategory::AntiPattern
            }
            _ => PatternCategory::CodeSmell,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            rules: vec![
                Rule::Singleton,
                Rule::Factory,
                Rule::GodClass { max_methods: 10 },
                Rule::LongFunction { max_lines: 50 },
                Rule::ComplexFunction { max_complexity: 10 },
                Rule::DeepNesting { max_depth: 4 },
                Rule::CircularDependency,
                Rule::HubModule { min_dependents: 10 },
                Rule::UnresolvedImport,
                Rule::NamingConvention {
                    kind: DeclarationKind::Class,
                    pattern: r"^_*[A-Z][A-Za-z0-9]*$".to_string(),
                    technologies: vec![
                        Technology::Python,
                        Technology::Java,
                        Technology::TypeScript,
                        Technology::JavaScript,
                        Technology::Rust,
                    ],
                },
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Location {
    pub path: String,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PatternMatch {
    pub pattern_id: String,
    pub category: PatternCategory,
    pub locations: Vec<Location>,
    pub confidence: f64,
    pub message: String,
}

impl PatternMatch {
    fn sort_key(&self) -> (&str, usize, usize, &str, &str) {
        let (path, start, end) = self
            .locations
            .first()
            .map(|l| (l.path.as_str(), l.span.start, l.span.end))
            .unwrap_or(("", 0, 0));
        (path, start, end, self.pattern_id.as_str(), self.message.as_str())
    }

    /// Total order over reports, independent of rule order.
    fn order(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then_with(|| self.confidence.total_cmp(&other.confidence))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RuleError {
    pub rule_id: String,
    /// Empty when the rule failed before reaching any file.
    pub path: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PatternReport {
    pub generation: u64,
    pub matches: Vec<PatternMatch>,
    pub errors: Vec<RuleError>,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

struct EvalContext<'a> {
    graph: &'a DependencyGraph,
}

/// A rule with anything it needs precompiled.
struct Prepared<'a> {
    rule: &'a Rule,
    naming: Option<Regex>,
}

const SINGLETON_ACCESSORS: &[(&str, f64)] = &[
    ("get_instance", 0.9),
    ("getInstance", 0.9),
    ("instance", 0.6),
    ("shared", 0.6),
];

const FACTORY_PREFIXES: &[&str] = &["create_", "make_", "build_"];

fn clamp_confidence(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// 0.5 at the threshold, rising to 1.0 at twice the threshold.
fn excess_confidence(value: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 1.0;
    }
    clamp_confidence(0.5 + 0.5 * ((value - limit) / limit).min(1.0))
}

fn is_factory_method(name: &str) -> bool {
    FACTORY_PREFIXES.iter().any(|p| name.starts_with(p))
        || name
            .strip_prefix("create")
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| c.is_ascii_uppercase())
}

fn class_like(decl: &Declaration) -> bool {
    matches!(decl.kind, DeclarationKind::Class | DeclarationKind::Impl)
}

fn whole_file(file: &IndexedFile) -> Span {
    Span::new(
        0,
        file.record.size_bytes as usize,
        1,
        file.record.line_count.max(1),
    )
}

impl Prepared<'_> {
    fn matched(&self, path: &str, span: Span, confidence: f64, message: String) -> PatternMatch {
        PatternMatch {
            pattern_id: self.rule.id().to_string(),
            category: self.rule.category(),
            locations: vec![Location {
                path: path.to_string(),
                span,
            }],
            confidence: clamp_confidence(confidence),
            message,
        }
    }

    fn evaluate(
        &self,
        ctx: &EvalContext<'_>,
        path: &str,
        file: &IndexedFile,
    ) -> RefractResult<Vec<PatternMatch>> {
        let decls = file.unit.all_declarations();
        let mut out = Vec::new();
        match self.rule {
            Rule::Singleton => {
                for class in decls.iter().filter(|d| class_like(d)) {
                    let best = class
                        .methods()
                        .filter_map(|m| {
                            SINGLETON_ACCESSORS
                                .iter()
                                .find(|(name, _)| *name == m.name)
                                .map(|(_, c)| *c)
                        })
                        .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.max(c))));
                    if let Some(confidence) = best {
                        out.push(self.matched(
                            path,
                            class.span,
                            confidence,
                            format!("`{}` exposes a shared instance accessor", class.name),
                        ));
                    }
                }
            }
            Rule::Factory => {
                for class in decls.iter().filter(|d| class_like(d)) {
                    let count = class.methods().filter(|m| is_factory_method(&m.name)).count();
                    if count > 0 {
                        out.push(self.matched(
                            path,
                            class.span,
                            0.5 + 0.1 * count as f64,
                            format!("`{}` has {count} factory method(s)", class.name),
                        ));
                    }
                }
            }
            Rule::GodClass { max_methods } => {
                for class in decls.iter().filter(|d| class_like(d)) {
                    let count = class.methods().count();
                    if count > *max_methods {
                        out.push(self.matched(
                            path,
                            class.span,
                            excess_confidence(count as f64, *max_methods as f64),
                            format!("Class has {count} methods"),
                        ));
                    }
                }
            }
            Rule::LongFunction { max_lines } => {
                for func in decls.iter().filter(|d| d.kind == DeclarationKind::Function) {
                    let lines = func.span.line_count();
                    if lines > *max_lines {
                        out.push(self.matched(
                            path,
                            func.span,
                            excess_confidence(lines as f64, *max_lines as f64),
                            format!("`{}` is {lines} lines long", func.name),
                        ));
                    }
                }
            }
            Rule::ComplexFunction { max_complexity } => {
                for func in decls.iter().filter(|d| d.kind == DeclarationKind::Function) {
                    if func.complexity > *max_complexity {
                        out.push(self.matched(
                            path,
                            func.span,
                            excess_confidence(func.complexity as f64, *max_complexity as f64),
                            format!("`{}` has complexity {}", func.name, func.complexity),
                        ));
                    }
                }
            }
            Rule::DeepNesting { max_depth } => {
                for func in decls.iter().filter(|d| d.kind == DeclarationKind::Function) {
                    if func.max_nesting > *max_depth {
                        out.push(self.matched(
                            path,
                            func.span,
                            excess_confidence(func.max_nesting as f64, *max_depth as f64),
                            format!("`{}` nests {} levels deep", func.name, func.max_nesting),
                        ));
                    }
                }
            }
            Rule::CircularDependency => {
                // Reported once per group, from its first member.
                for group in ctx.graph.cycles.iter().filter(|g| g.first().map(String::as_str) == Some(path)) {
                    let members: BTreeSet<&str> = group.iter().map(String::as_str).collect();
                    let mut locations = Vec::new();
                    for member in group {
                        let Some(contribution) = ctx.graph.per_file.get(member) else {
                            continue;
                        };
                        let line = contribution
                            .imports
                            .iter()
                            .find(|i| i.targets.iter().any(|t| members.contains(t.as_str()) && t != member))
                            .map(|i| i.line)
                            .unwrap_or(1);
                        locations.push(Location {
                            path: member.clone(),
                            span: Span::new(0, 0, line, line),
                        });
                    }
                    out.push(PatternMatch {
                        pattern_id: self.rule.id().to_string(),
                        category: self.rule.category(),
                        locations,
                        confidence: 1.0,
                        message: format!("Import cycle between {} files: {}", group.len(), group.join(" -> ")),
                    });
                }
            }
            Rule::HubModule { min_dependents } => {
                let dependents = ctx.graph.dependents_of(path).len();
                if dependents >= *min_dependents && *min_dependents > 0 {
                    out.push(self.matched(
                        path,
                        whole_file(file),
                        excess_confidence(dependents as f64, *min_dependents as f64),
                        format!("{dependents} files depend on this module"),
                    ));
                }
            }
            Rule::UnresolvedImport => {
                if let Some(contribution) = ctx.graph.per_file.get(path) {
                    for (edge, resolved) in file.unit.imports.iter().zip(&contribution.imports) {
                        let confidence = match &resolved.unresolved {
                            Some(UnresolvedReason::NotFound) => 1.0,
                            Some(UnresolvedReason::Ambiguous { .. }) => 0.7,
                            _ => continue,
                        };
                        out.push(self.matched(
                            path,
                            edge.span,
                            confidence,
                            format!("Import `{}` does not resolve to a unique file", edge.module),
                        ));
                    }
                }
            }
            Rule::NamingConvention {
                kind, technologies, ..
            } => {
                if !technologies.is_empty() && !technologies.contains(&file.record.technology) {
                    return Ok(out);
                }
                let regex = self.naming.as_ref().ok_or_else(|| RefractError::Rule {
                    rule: self.rule.id().to_string(),
                    message: "pattern not compiled".to_string(),
                })?;
                for decl in decls.iter().filter(|d| d.kind == *kind) {
                    if !regex.is_match(&decl.name) {
                        out.push(self.matched(
                            path,
                            decl.name_span,
                            0.8,
                            format!("`{}` does not match {}", decl.name, regex.as_str()),
                        ));
                    }
                }
            }
        }
        Ok(out)
    }
}

fn prepare(rule: &Rule) -> Result<Prepared<'_>, RuleError> {
    let naming = match rule {
        Rule::NamingConvention { pattern, .. } => {
            Some(Regex::new(pattern).map_err(|e| RuleError {
                rule_id: rule.id().to_string(),
                path: String::new(),
                message: format!("invalid pattern: {e}"),
            })?)
        }
        _ => None,
    };
    Ok(Prepared { rule, naming })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "rule panicked".to_string()
    }
}

/// Run one (rule, file) evaluation, turning errors and panics into a
/// [`RuleError`].
fn isolated<F>(rule_id: &str, path: &str, evaluation: F) -> Result<Vec<PatternMatch>, RuleError>
where
    F: FnOnce() -> RefractResult<Vec<PatternMatch>>,
{
    let fault = |message: String| {
        warn!(rule = rule_id, path, %message, "pattern rule failed");
        RuleError {
            rule_id: rule_id.to_string(),
            path: path.to_string(),
            message,
        }
    };
    match catch_unwind(AssertUnwindSafe(evaluation)) {
        Ok(Ok(matches)) => Ok(matches),
        Ok(Err(err)) => Err(fault(err.to_string())),
        Err(payload) => Err(fault(panic_message(payload.as_ref()))),
    }
}

/// Evaluate `rules` over every file of the snapshot.
pub fn find_patterns(
    snapshot: &IndexSnapshot,
    graph: &DependencyGraph,
    rules: &RuleSet,
) -> PatternReport {
    find_patterns_in(snapshot, graph, rules, &Scope::all())
}

/// Evaluate `rules` over the files of `scope`.
pub fn find_patterns_in(
    snapshot: &IndexSnapshot,
    graph: &DependencyGraph,
    rules: &RuleSet,
    scope: &Scope,
) -> PatternReport {
    let mut report = PatternReport {
        generation: snapshot.generation(),
        ..PatternReport::default()
    };
    let mut prepared = Vec::new();
    for rule in &rules.rules {
        match prepare(rule) {
            Ok(p) => prepared.push(p),
            Err(err) => {
                warn!(rule = %err.rule_id, message = %err.message, "pattern rule rejected");
                report.errors.push(err);
            }
        }
    }

    let ctx = &EvalContext { graph };
    let prepared = &prepared;
    let files: Vec<(&String, &Arc<IndexedFile>)> = snapshot.files_in(scope).collect();
    let outcomes: Vec<Result<Vec<PatternMatch>, RuleError>> = files
        .par_iter()
        .flat_map_iter(move |&(path, file)| {
            prepared.iter().map(move |rule| {
                isolated(rule.rule.id(), path, || rule.evaluate(ctx, path, file))
            })
        })
        .collect();

    for outcome in outcomes {
        match outcome {
            Ok(matches) => report.matches.extend(matches),
            Err(err) => report.errors.push(err),
        }
    }
    report.matches.sort_by(PatternMatch::order);
    report.matches.dedup_by(|a, b| a.sort_key() == b.sort_key());
    debug!(
        generation = report.generation,
        matches = report.matches.len(),
        errors = report.errors.len(),
        "pattern pass finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::filesystem::compute_content_hash;
    use crate::indexer::graph::build;
    use crate::indexer::parser::parse;
    use crate::models::{FileRecord, ParseStatus};
    use crate::store::index::{IndexChange, ProjectIndex};

    fn index_of(files: &[(&str, &str)]) -> ProjectIndex {
        let index = ProjectIndex::new();
        let changes = files
            .iter()
            .map(|(path, src)| {
                let unit = parse(path, src, Technology::Python).unwrap();
                IndexChange::Upsert(
                    FileRecord {
                        path: path.to_string(),
                        technology: Technology::Python,
                        fingerprint: compute_content_hash(src.as_bytes()),
                        content_hash: compute_content_hash(src.as_bytes()),
                        size_bytes: src.len() as u64,
                        mtime_ns: 0,
                        line_count: src.lines().count(),
                        status: ParseStatus::Parsed,
                    },
                    unit,
                )
            })
            .collect();
        index.commit(changes);
        index
    }

    fn ids(report: &PatternReport) -> Vec<&str> {
        report.matches.iter().map(|m| m.pattern_id.as_str()).collect()
    }

    fn god_class_source(methods: usize) -> String {
        let mut src = String::from("class Big:\n");
        for i in 0..methods {
            src.push_str(&format!("    def m{i}(self):\n        pass\n"));
        }
        src
    }

    #[test]
    fn test_design_patterns_detected() {
        let src = "\
class Registry:
    def get_instance(cls):
        return cls

class Shapes:
    def create_circle(self):
        pass
    def create_square(self):
        pass
";
        let index = index_of(&[("shapes.py", src)]);
        let snap = index.snapshot();
        let report = find_patterns(&snap, &build(&snap), &RuleSet::default());
        assert!(report.errors.is_empty());
        assert_eq!(ids(&report), vec!["singleton", "factory"]);
        let factory = &report.matches[1];
        assert!((factory.confidence - 0.7).abs() < 1e-9);
        assert_eq!(factory.category, PatternCategory::DesignPattern);
    }

    #[test]
    fn test_god_class_threshold() {
        let index = index_of(&[("big.py", &god_class_source(11)), ("ok.py", &god_class_source(10))]);
        let snap = index.snapshot();
        let rules = RuleSet {
            rules: vec![Rule::GodClass { max_methods: 10 }],
        };
        let report = find_patterns(&snap, &build(&snap), &rules);
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].locations[0].path, "big.py");
        assert_eq!(report.matches[0].message, "Class has 11 methods");
    }

    #[test]
    fn test_circular_dependency_reported_once() {
        let index = index_of(&[
            ("a.py", "import b\n"),
            ("b.py", "import c\n"),
            ("c.py", "import a\n"),
        ]);
        let snap = index.snapshot();
        let rules = RuleSet {
            rules: vec![Rule::CircularDependency],
        };
        let report = find_patterns(&snap, &build(&snap), &rules);
        assert_eq!(report.matches.len(), 1);
        assert_eq!(report.matches[0].locations.len(), 3);
        assert_eq!(report.matches[0].confidence, 1.0);
    }

    #[test]
    fn test_bad_rule_does_not_block_others() {
        let index = index_of(&[("big.py", &god_class_source(12))]);
        let snap = index.snapshot();
        let rules = RuleSet {
            rules: vec![
                Rule::NamingConvention {
                    kind: DeclarationKind::Class,
                    pattern: "([".to_string(),
                    technologies: vec![],
                },
                Rule::GodClass { max_methods: 10 },
            ],
        };
        let report = find_patterns(&snap, &build(&snap), &rules);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].rule_id, "naming_convention");
        assert_eq!(ids(&report), vec!["god_class"]);
    }

    #[test]
    fn test_panicking_evaluation_is_isolated() {
        let result = isolated("boom", "a.py", || -> RefractResult<Vec<PatternMatch>> {
            panic!("rule exploded")
        });
        let err = result.unwrap_err();
        assert_eq!(err.rule_id, "boom");
        assert_eq!(err.path, "a.py");
        assert!(err.message.contains("rule exploded"));

        let failing = isolated("bad", "b.py", || {
            Err(RefractError::Rule {
                rule: "bad".to_string(),
                message: "nope".to_string(),
            })
        });
        assert!(failing.unwrap_err().message.contains("nope"));
    }

    #[test]
    fn test_matches_are_sorted_and_deduplicated() {
        let index = index_of(&[
            ("z.py", "class lower:\n    pass\n"),
            ("a.py", "class lower:\n    pass\n"),
        ]);
        let snap = index.snapshot();
        let rules = RuleSet {
            rules: vec![
                Rule::NamingConvention {
                    kind: DeclarationKind::Class,
                    pattern: "^[A-Z]".to_string(),
                    technologies: vec![],
                },
                Rule::NamingConvention {
                    kind: DeclarationKind::Class,
                    pattern: "^[A-Z]".to_string(),
                    technologies: vec![],
                },
            ],
        };
        let report = find_patterns(&snap, &build(&snap), &rules);
        let paths: Vec<&str> = report
            .matches
            .iter()
            .map(|m| m.locations[0].path.as_str())
            .collect();
        assert_eq!(paths, vec!["a.py", "z.py"]);
    }

    #[test]
    fn test_report_independent_of_rule_order() {
        let index = index_of(&[
            ("m.py", "class lower:\n    pass\n"),
            ("n.py", "class other:\n    pass\n"),
        ]);
        let snap = index.snapshot();
        let graph = build(&snap);
        let naming = |pattern: &str| Rule::NamingConvention {
            kind: DeclarationKind::Class,
            pattern: pattern.to_string(),
            technologies: vec![],
        };
        let forward = RuleSet {
            rules: vec![naming("^[A-Z]"), naming("^X"), naming("^[A-Z]")],
        };
        let backward = RuleSet {
            rules: vec![naming("^X"), naming("^[A-Z]")],
        };
        let a = find_patterns(&snap, &graph, &forward);
        let b = find_patterns(&snap, &graph, &backward);
        assert_eq!(a, b);
        assert_eq!(a.matches.len(), 4);
        let messages: Vec<&str> = a
            .matches
            .iter()
            .filter(|m| m.locations[0].path == "m.py")
            .map(|m| m.message.as_str())
            .collect();
        assert_eq!(messages, vec!["`lower` does not match ^X", "`lower` does not match ^[A-Z]"]);
    }

    #[test]
    fn test_confidence_bounds() {
        assert_eq!(excess_confidence(10.0, 10.0), 0.5);
        assert_eq!(excess_confidence(100.0, 10.0), 1.0);
        assert!(is_factory_method("createWidget"));
        assert!(!is_factory_method("creates"));
    }
}
