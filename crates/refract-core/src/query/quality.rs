//! Quality metrics: decision-point complexity, size, nesting and a bounded
//! maintainability score, per file and aggregated per project.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::{DeclarationKind, FileRecord, Scope, StructuralUnit, Technology};
use crate::store::index::IndexSnapshot;

/// Number of files listed as the weakest in a project aggregate.
pub const LOWEST_MAINTAINABILITY_COUNT: usize = 5;

/// Weights and ceilings of the maintainability score, plus issue thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricWeights {
    pub complexity: f64,
    pub size: f64,
    pub nesting: f64,
    pub complexity_ceiling: f64,
    pub size_ceiling_lines: f64,
    pub nesting_ceiling: f64,
    pub long_function_lines: usize,
    pub max_class_methods: usize,
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self {
            complexity: 0.5,
            size: 0.3,
            nesting: 0.2,
            complexity_ceiling: 50.0,
            size_ceiling_lines: 1000.0,
            nesting_ceiling: 8.0,
            long_function_lines: 50,
            max_class_methods: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeclarationMetrics {
    pub qualified_name: String,
    pub kind: DeclarationKind,
    pub start_line: usize,
    pub lines: usize,
    pub complexity: u32,
    pub max_nesting: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QualityIssue {
    /// `long_function` or `complex_class`.
    pub kind: String,
    pub line: usize,
    pub message: String,
    pub suggestion: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileMetrics {
    pub path: String,
    pub technology: Technology,
    pub lines: usize,
    pub complexity: u32,
    pub max_nesting: u32,
    pub maintainability: f64,
    pub parse_failed: bool,
    pub declarations: Vec<DeclarationMetrics>,
    pub issues: Vec<QualityIssue>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileScore {
    pub path: String,
    pub maintainability: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProjectMetrics {
    pub file_count: usize,
    pub total_lines: usize,
    pub total_complexity: u64,
    pub average_complexity: f64,
    pub average_maintainability: f64,
    pub max_nesting: u32,
    pub lowest_maintainability: Vec<FileScore>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QualityReport {
    pub generation: u64,
    pub files: Vec<FileMetrics>,
    pub project: ProjectMetrics,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

fn ratio(value: f64, ceiling: f64) -> f64 {
    if ceiling <= 0.0 {
        return 1.0;
    }
    (value / ceiling).clamp(0.0, 1.0)
}

/// `100 * (1 - weighted mean of saturated ratios)`, always within [0, 100].
pub fn maintainability(lines: usize, complexity: u32, nesting: u32, weights: &MetricWeights) -> f64 {
    let terms = [
        (weights.complexity.max(0.0), ratio(complexity as f64, weights.complexity_ceiling)),
        (weights.size.max(0.0), ratio(lines as f64, weights.size_ceiling_lines)),
        (weights.nesting.max(0.0), ratio(nesting as f64, weights.nesting_ceiling)),
    ];
    let total_weight: f64 = terms.iter().map(|(w, _)| w).sum();
    if total_weight <= 0.0 {
        return 100.0;
    }
    let penalty: f64 = terms.iter().map(|(w, r)| w * r).sum::<f64>() / total_weight;
    (100.0 * (1.0 - penalty)).clamp(0.0, 100.0)
}

pub fn compute_file(record: &FileRecord, unit: &StructuralUnit, weights: &MetricWeights) -> FileMetrics {
    let complexity = 1 + unit.decision_points;
    let mut declarations = Vec::new();
    let mut issues = Vec::new();

    for decl in unit.all_declarations() {
        if decl.kind == DeclarationKind::Unparsed {
            continue;
        }
        let lines = decl.span.line_count();
        declarations.push(DeclarationMetrics {
            qualified_name: decl.qualified_name.clone(),
            kind: decl.kind,
            start_line: decl.span.start_line,
            lines,
            complexity: decl.complexity,
            max_nesting: decl.max_nesting,
        });
        match decl.kind {
            DeclarationKind::Function if lines > weights.long_function_lines => {
                issues.push(QualityIssue {
                    kind: "long_function".to_string(),
                    line: decl.span.start_line,
                    message: format!("Function {} is too long ({lines} lines)", decl.name),
                    suggestion: format!(
                        "Consider breaking down function {} into smaller functions",
                        decl.name
                    ),
                });
            }
            DeclarationKind::Class | DeclarationKind::Impl => {
                let methods = decl.methods().count();
                if methods > weights.max_class_methods {
                    issues.push(QualityIssue {
                        kind: "complex_class".to_string(),
                        line: decl.span.start_line,
                        message: format!("Class {} has too many methods ({methods})", decl.name),
                        suggestion: format!(
                            "Consider splitting class {} into smaller classes",
                            decl.name
                        ),
                    });
                }
            }
            _ => {}
        }
    }

    FileMetrics {
        path: record.path.clone(),
        technology: record.technology,
        lines: record.line_count,
        complexity,
        max_nesting: unit.max_nesting,
        maintainability: maintainability(record.line_count, complexity, unit.max_nesting, weights),
        parse_failed: record.status.is_failed(),
        declarations,
        issues,
    }
}

pub fn aggregate(files: &[FileMetrics]) -> ProjectMetrics {
    if files.is_empty() {
        return ProjectMetrics::default();
    }
    let count = files.len() as f64;
    let total_complexity: u64 = files.iter().map(|f| f.complexity as u64).sum();
    let mut ranked: Vec<&FileMetrics> = files.iter().collect();
    ranked.sort_by(|a, b| {
        a.maintainability
            .total_cmp(&b.maintainability)
            .then_with(|| a.path.cmp(&b.path))
    });
    ProjectMetrics {
        file_count: files.len(),
        total_lines: files.iter().map(|f| f.lines).sum(),
        total_complexity,
        average_complexity: total_complexity as f64 / count,
        average_maintainability: files.iter().map(|f| f.maintainability).sum::<f64>() / count,
        max_nesting: files.iter().map(|f| f.max_nesting).max().unwrap_or(0),
        lowest_maintainability: ranked
            .into_iter()
            .take(LOWEST_MAINTAINABILITY_COUNT)
            .map(|f| FileScore {
                path: f.path.clone(),
                maintainability: f.maintainability,
            })
            .collect(),
    }
}

/// Metrics for every file of `scope` in one snapshot.
pub fn quality_report(snapshot: &IndexSnapshot, scope: &Scope, weights: &MetricWeights) -> QualityReport {
    let files: Vec<_> = snapshot.files_in(scope).map(|(_, f)| f).collect();
    let metrics: Vec<FileMetrics> = files
        .par_iter()
        .map(|f| compute_file(&f.record, &f.unit, weights))
        .collect();
    QualityReport {
        generation: snapshot.generation(),
        project: aggregate(&metrics),
        files: metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::parser::parse;
    use crate::models::ParseStatus;

    fn record(path: &str, src: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            technology: Technology::Python,
            fingerprint: String::new(),
            content_hash: String::new(),
            size_bytes: src.len() as u64,
            mtime_ns: 0,
            line_count: src.lines().count(),
            status: ParseStatus::Parsed,
        }
    }

    fn metrics(src: &str) -> FileMetrics {
        let unit = parse("m.py", src, Technology::Python).unwrap();
        compute_file(&record("m.py", src), &unit, &MetricWeights::default())
    }

    #[test]
    fn test_maintainability_bounds() {
        let w = MetricWeights::default();
        assert_eq!(maintainability(0, 0, 0, &w), 100.0);
        assert_eq!(maintainability(100_000, 10_000, 100, &w), 0.0);
        let zero = MetricWeights {
            complexity: 0.0,
            size: 0.0,
            nesting: 0.0,
            ..MetricWeights::default()
        };
        assert_eq!(maintainability(500, 20, 3, &zero), 100.0);
    }

    #[test]
    fn test_adding_a_branch_never_lowers_complexity() {
        let before = metrics("def f(x):\n    return x\n");
        let after = metrics("def f(x):\n    if x:\n        return 1\n    return x\n");
        assert!(after.complexity > before.complexity);
        assert!(after.declarations[0].complexity >= before.declarations[0].complexity);
    }

    #[test]
    fn test_long_function_issue() {
        let mut src = String::from("def long():\n");
        for i in 0..55 {
            src.push_str(&format!("    x{i} = {i}\n"));
        }
        let m = metrics(&src);
        assert_eq!(m.issues.len(), 1);
        assert_eq!(m.issues[0].kind, "long_function");
        assert!(m.issues[0].suggestion.contains("long"));
    }

    #[test]
    fn test_aggregate_lists_lowest_five() {
        let w = MetricWeights::default();
        let files: Vec<FileMetrics> = (0..7)
            .map(|i| FileMetrics {
                path: format!("f{i}.py"),
                technology: Technology::Python,
                lines: 100 * i,
                complexity: 1 + i as u32,
                max_nesting: i as u32,
                maintainability: maintainability(100 * i, 1 + i as u32, i as u32, &w),
                parse_failed: false,
                declarations: vec![],
                issues: vec![],
            })
            .collect();
        let project = aggregate(&files);
        assert_eq!(project.file_count, 7);
        assert_eq!(project.total_lines, 2100);
        assert_eq!(project.max_nesting, 6);
        let lowest: Vec<&str> = project
            .lowest_maintainability
            .iter()
            .map(|s| s.path.as_str())
            .collect();
        assert_eq!(lowest, vec!["f6.py", "f5.py", "f4.py", "f3.py", "f2.py"]);
    }

    #[test]
    fn test_empty_aggregate() {
        assert_eq!(aggregate(&[]), ProjectMetrics::default());
    }
}
