//! Refactor planning: resolve a target, compute every edit and assess the
//! impact. Planning never touches the filesystem beyond reading sources.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::{RefractError, RefractResult};
use crate::indexer::filesystem::compute_content_hash;
use crate::indexer::graph::DependencyGraph;
use crate::indexer::parser::malformed_regions;
use crate::indexer::pipeline::CancellationToken;
use crate::indexer::symbols::mask_source;
use crate::models::{Declaration, LineIndex, Scope, Span, SymbolId};
use crate::query::patterns::PatternMatch;
use crate::query::references::import_sites;
use crate::query::usages::{occurrences, validate_pattern};
use crate::refactor::diff::{apply_edits, Edit};
use crate::refactor::fs::SourceReader;
use crate::store::index::IndexSnapshot;

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Length of the hex plan id.
const PLAN_ID_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Plan state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Requested,
    Planned,
    PreviewReady,
    Applied,
    Rejected,
    Expired,
}

impl PlanState {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanState::Requested => "requested",
            PlanState::Planned => "planned",
            PlanState::PreviewReady => "preview_ready",
            PlanState::Applied => "applied",
            PlanState::Rejected => "rejected",
            PlanState::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanState::Applied | PlanState::Rejected | PlanState::Expired
        )
    }

    /// States from which `to` may be entered.
    fn sources_of(to: PlanState) -> &'static [PlanState] {
        match to {
            PlanState::Requested => &[],
            PlanState::Planned => &[PlanState::Requested],
            // Previewing again is allowed and keeps the state.
            PlanState::PreviewReady => &[PlanState::Planned, PlanState::PreviewReady],
            PlanState::Applied => &[PlanState::PreviewReady],
            PlanState::Rejected | PlanState::Expired => {
                &[PlanState::Planned, PlanState::PreviewReady]
            }
        }
    }

    pub fn can_transition(self, to: PlanState) -> bool {
        Self::sources_of(to).contains(&self)
    }

    pub fn transition(self, to: PlanState, plan_id: &str) -> RefractResult<PlanState> {
        if self.can_transition(to) {
            return Ok(to);
        }
        let expected = match Self::sources_of(to) {
            [] => "none".to_string(),
            sources => sources
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" or "),
        };
        Err(RefractError::InvalidPlanState {
            plan_id: plan_id.to_string(),
            expected,
            actual: self.as_str().to_string(),
        })
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefactorTarget {
    /// Simple or qualified name, optionally narrowed to a file or directory.
    Symbol {
        name: String,
        #[serde(default)]
        path: Option<String>,
    },
    /// Byte range `[start, end)` of one file.
    Section {
        path: String,
        start: usize,
        end: usize,
    },
    /// Every occurrence of literal `text` in code under `scope`. Comments
    /// and string literals are never matched.
    Pattern {
        text: String,
        #[serde(default)]
        scope: Scope,
    },
    /// Every location reported by the pattern rule `pattern_id`,
    /// optionally narrowed to a file or directory.
    Match {
        pattern_id: String,
        #[serde(default)]
        path: Option<String>,
    },
}

impl fmt::Display for RefactorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefactorTarget::Symbol { name, path: None } => write!(f, "symbol `{name}`"),
            RefactorTarget::Symbol {
                name,
                path: Some(path),
            } => write!(f, "symbol `{name}` in {path}"),
            RefactorTarget::Section { path, start, end } => {
                write!(f, "section {path}[{start}..{end}]")
            }
            RefactorTarget::Pattern { text, scope } if scope.paths.is_empty() => {
                write!(f, "pattern `{text}`")
            }
            RefactorTarget::Pattern { text, scope } => {
                write!(f, "pattern `{text}` in {}", scope.paths.join(", "))
            }
            RefactorTarget::Match {
                pattern_id,
                path: None,
            } => write!(f, "`{pattern_id}` matches"),
            RefactorTarget::Match {
                pattern_id,
                path: Some(path),
            } => write!(f, "`{pattern_id}` matches in {path}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPosition {
    Before,
    After,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RefactorIntent {
    Rename { new_name: String },
    Replace { text: String },
    Delete,
    Insert { text: String, position: InsertPosition },
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Immutable result of planning. The engine tracks its [`PlanState`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RefactorPlan {
    pub id: String,
    pub target: RefactorTarget,
    pub intent: RefactorIntent,
    /// Resolved symbol, for symbol targets.
    pub symbol: Option<SymbolId>,
    pub edits: Vec<Edit>,
    pub risk: RiskLevel,
    pub affected_files: Vec<String>,
    pub transitive_dependents: Vec<String>,
    pub warnings: Vec<String>,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    /// Content hash of every edited file at planning time.
    pub base_hashes: BTreeMap<String, String>,
}

impl RefactorPlan {
    pub fn paths(&self) -> BTreeSet<&str> {
        self.edits.iter().map(|e| e.path.as_str()).collect()
    }

    pub fn edits_for<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a Edit> + 'a {
        self.edits.iter().filter(move |e| e.path == path)
    }
}

/// Inputs shared by every planning call against one snapshot.
pub struct PlanContext<'a> {
    pub snapshot: &'a IndexSnapshot,
    pub graph: &'a DependencyGraph,
    pub reader: &'a dyn SourceReader,
    pub max_impact_depth: usize,
    /// Pattern report of the same snapshot, consulted by match targets.
    pub matches: &'a [PatternMatch],
}

/// Points from the risk heuristic; `High` at 5 or more, `Medium` at 3.
pub fn risk_level(affected: usize, dependents: usize, penalties: u32) -> RiskLevel {
    let mut score = penalties;
    score += match affected {
        n if n > 10 => 3,
        n if n > 5 => 2,
        n if n > 2 => 1,
        _ => 0,
    };
    score += match dependents {
        n if n > 5 => 3,
        n if n > 3 => 2,
        n if n > 1 => 1,
        _ => 0,
    };
    match score {
        s if s >= 5 => RiskLevel::High,
        s if s >= 3 => RiskLevel::Medium,
        _ => RiskLevel::Low,
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

struct ResolvedTarget<'a> {
    /// Ranges the intent applies to, in path then offset order.
    sites: Vec<(String, Span)>,
    symbol: Option<(SymbolId, &'a Declaration)>,
    /// Scattered text occurrences rather than whole declarations or sections.
    occurrences: bool,
}

impl ResolvedTarget<'_> {
    fn paths(&self) -> BTreeSet<String> {
        self.sites.iter().map(|(path, _)| path.clone()).collect()
    }
}

/// Sources read during planning, checked against the indexed content hash.
struct Sources<'a> {
    ctx: &'a PlanContext<'a>,
    loaded: BTreeMap<String, String>,
}

impl<'a> Sources<'a> {
    fn new(ctx: &'a PlanContext<'a>) -> Self {
        Self {
            ctx,
            loaded: BTreeMap::new(),
        }
    }

    fn get(&mut self, path: &str) -> RefractResult<&str> {
        if !self.loaded.contains_key(path) {
            let Some(file) = self.ctx.snapshot.get(path) else {
                return Err(RefractError::UnresolvedTarget(format!(
                    "{path} is not indexed"
                )));
            };
            let content = self.ctx.reader.read(path)?;
            if compute_content_hash(content.as_bytes()) != file.record.content_hash {
                return Err(RefractError::UnresolvedTarget(format!(
                    "{path} changed since generation {}; re-index before planning",
                    self.ctx.snapshot.generation()
                )));
            }
            self.loaded.insert(path.to_string(), content);
        }
        Ok(self.loaded.get(path).map(String::as_str).unwrap_or_default())
    }
}

fn resolve_target<'s>(
    target: &RefactorTarget,
    ctx: &PlanContext<'s>,
    sources: &mut Sources<'_>,
    cancel: &CancellationToken,
) -> RefractResult<ResolvedTarget<'s>> {
    let snapshot = ctx.snapshot;
    match target {
        RefactorTarget::Symbol { name, path } => {
            let filter = path.as_ref().map(|p| Scope::paths([p.as_str()]));
            let mut candidates: Vec<(SymbolId, &Declaration)> = snapshot
                .declarations_named(name)
                .into_iter()
                .filter(|(id, _)| filter.as_ref().map_or(true, |s| s.contains(&id.path)))
                .collect();
            match candidates.len() {
                0 => Err(RefractError::UnresolvedTarget(format!("no {target}"))),
                1 => {
                    let (id, decl) = candidates.remove(0);
                    Ok(ResolvedTarget {
                        sites: vec![(id.path.clone(), decl.span)],
                        symbol: Some((id, decl)),
                        occurrences: false,
                    })
                }
                _ => {
                    let listed: Vec<String> =
                        candidates.iter().map(|(id, _)| id.to_string()).collect();
                    Err(RefractError::UnresolvedTarget(format!(
                        "{target} is ambiguous: {}",
                        listed.join(", ")
                    )))
                }
            }
        }
        RefactorTarget::Section { path, start, end } => {
            let content = sources.get(path)?;
            if start > end
                || *end > content.len()
                || !content.is_char_boundary(*start)
                || !content.is_char_boundary(*end)
            {
                return Err(RefractError::InvalidIntent(format!(
                    "{target} is not a valid range of a {} byte file",
                    content.len()
                )));
            }
            Ok(ResolvedTarget {
                sites: vec![(path.clone(), LineIndex::new(content).span(*start, *end))],
                symbol: None,
                occurrences: false,
            })
        }
        RefactorTarget::Pattern { text, scope } => {
            validate_pattern(text).map_err(RefractError::InvalidIntent)?;
            let mut sites = Vec::new();
            for (path, file) in snapshot.files_in(scope) {
                cancel.check()?;
                let content = sources.get(path)?;
                for span in occurrences(content, file.record.technology, text) {
                    sites.push((path.clone(), span));
                }
            }
            if sites.is_empty() {
                return Err(RefractError::UnresolvedTarget(format!(
                    "no occurrence of {target}"
                )));
            }
            Ok(ResolvedTarget {
                sites,
                symbol: None,
                occurrences: true,
            })
        }
        RefactorTarget::Match { pattern_id, path } => {
            let filter = path.as_ref().map(|p| Scope::paths([p.as_str()]));
            let mut sites: Vec<(String, Span)> = ctx
                .matches
                .iter()
                .filter(|m| m.pattern_id == *pattern_id)
                .flat_map(|m| m.locations.iter())
                .filter(|l| !l.span.is_empty())
                .filter(|l| filter.as_ref().map_or(true, |s| s.contains(&l.path)))
                .map(|l| (l.path.clone(), l.span))
                .collect();
            sites.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.start.cmp(&b.1.start)));
            sites.dedup();
            if sites.is_empty() {
                return Err(RefractError::UnresolvedTarget(format!(
                    "no {target} with a source range"
                )));
            }
            Ok(ResolvedTarget {
                sites,
                symbol: None,
                occurrences: false,
            })
        }
    }
}

fn text_edit(path: &str, content: &str, span: Span, replacement: &str) -> Edit {
    Edit {
        path: path.to_string(),
        span,
        original: content[span.start..span.end].to_string(),
        replacement: replacement.to_string(),
    }
}

struct EditSet {
    edits: Vec<Edit>,
    referencing: BTreeSet<String>,
    warnings: Vec<String>,
    penalties: u32,
}

impl EditSet {
    fn new(edits: Vec<Edit>) -> Self {
        Self {
            edits,
            referencing: BTreeSet::new(),
            warnings: Vec::new(),
            penalties: 0,
        }
    }
}

/// One edit per site of `resolved`, placed and filled in by `edit`.
fn site_edits<F>(
    resolved: &ResolvedTarget<'_>,
    sources: &mut Sources<'_>,
    cancel: &CancellationToken,
    mut edit: F,
) -> RefractResult<Vec<Edit>>
where
    F: FnMut(&str, Span) -> (Span, String),
{
    let mut edits = Vec::with_capacity(resolved.sites.len());
    for (path, site) in &resolved.sites {
        cancel.check()?;
        let content = sources.get(path)?;
        let (span, replacement) = edit(content, *site);
        edits.push(text_edit(path, content, span, &replacement));
    }
    Ok(edits)
}

fn rename_edits(
    id: &SymbolId,
    decl: &Declaration,
    new_name: &str,
    ctx: &PlanContext<'_>,
    sources: &mut Sources<'_>,
    cancel: &CancellationToken,
) -> RefractResult<EditSet> {
    if !IDENTIFIER_RE.is_match(new_name) {
        return Err(RefractError::InvalidIntent(format!(
            "`{new_name}` is not a valid identifier"
        )));
    }
    if new_name == decl.name {
        return Err(RefractError::InvalidIntent(format!(
            "{id} is already named `{new_name}`"
        )));
    }
    let old = decl.name.as_str();
    let mut set = EditSet::new(Vec::new());

    // Declaration site, then every resolved reference, then import lists
    // naming the symbol, each only where the text is exactly the old name.
    let mut sites: Vec<(String, Span)> = vec![(id.path.clone(), decl.name_span)];
    for (path, reference) in ctx.graph.references_to(id) {
        sites.push((path.clone(), reference.span));
    }
    sites.extend(import_sites(ctx.snapshot, ctx.graph, id, old));
    sites.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.start.cmp(&b.1.start)));
    sites.dedup();

    for (path, span) in sites {
        cancel.check()?;
        let content = sources.get(&path)?;
        if content.get(span.start..span.end) != Some(old) {
            set.warnings.push(format!(
                "skipped {path}:{} where the text is not `{old}`",
                span.start_line
            ));
            continue;
        }
        if path != id.path {
            set.referencing.insert(path.clone());
        }
        set.edits.push(text_edit(&path, content, span, new_name));
    }
    Ok(set)
}

/// Build a plan for `intent` applied to `target`. Reads sources through
/// `ctx.reader` but never writes.
pub fn plan(
    target: RefactorTarget,
    intent: RefactorIntent,
    ctx: &PlanContext<'_>,
    cancel: &CancellationToken,
) -> RefractResult<RefactorPlan> {
    cancel.check()?;
    let mut sources = Sources::new(ctx);
    let resolved = resolve_target(&target, ctx, &mut sources, cancel)?;
    let target_paths = resolved.paths();
    let symbol_id = resolved.symbol.as_ref().map(|(id, _)| id.clone());
    let references: BTreeSet<String> = match &symbol_id {
        Some(id) => ctx
            .graph
            .references_to(id)
            .map(|(path, _)| path.clone())
            .filter(|p| !target_paths.contains(p))
            .collect(),
        None => BTreeSet::new(),
    };

    let set = match &intent {
        RefactorIntent::Rename { new_name } => {
            let Some((id, decl)) = &resolved.symbol else {
                return Err(RefractError::InvalidIntent(
                    "rename needs a symbol target".to_string(),
                ));
            };
            rename_edits(id, decl, new_name, ctx, &mut sources, cancel)?
        }
        RefactorIntent::Replace { text } => EditSet::new(site_edits(
            &resolved,
            &mut sources,
            cancel,
            |_, span| (span, text.clone()),
        )?),
        RefactorIntent::Delete => {
            // Whole declarations and sections take their line break along.
            let whole_lines = !resolved.occurrences;
            let mut set = EditSet::new(site_edits(&resolved, &mut sources, cancel, |content, span| {
                if whole_lines && content.as_bytes().get(span.end) == Some(&b'\n') {
                    (LineIndex::new(content).span(span.start, span.end + 1), String::new())
                } else {
                    (span, String::new())
                }
            })?);
            if let Some(id) = &symbol_id {
                let remaining = ctx.graph.references_to(id).count();
                if remaining > 0 {
                    set.warnings.push(format!(
                        "{remaining} reference(s) to {id} remain after deletion"
                    ));
                    set.penalties += 2;
                }
            }
            set
        }
        RefactorIntent::Insert { text, position } => EditSet::new(site_edits(
            &resolved,
            &mut sources,
            cancel,
            |content, span| {
                let at = match position {
                    InsertPosition::Before => span.start,
                    InsertPosition::After => span.end,
                };
                (LineIndex::new(content).span(at, at), text.clone())
            },
        )?),
    };
    let EditSet {
        mut edits,
        referencing,
        mut warnings,
        mut penalties,
    } = set;

    edits.sort_by(|a, b| {
        a.path
            .cmp(&b.path)
            .then(a.span.start.cmp(&b.span.start))
            .then(a.span.end.cmp(&b.span.end))
    });
    for pair in edits.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let same_point = a.span.is_empty() && b.span.is_empty() && a.span.start == b.span.start;
        if a.path == b.path && (a.span.overlaps(&b.span) || same_point) {
            return Err(RefractError::InvalidIntent(format!(
                "edits overlap in {} at line {}",
                b.path, b.span.start_line
            )));
        }
    }

    // Syntax errors introduced by the edits.
    let mut base_hashes = BTreeMap::new();
    let mut by_path: BTreeMap<&str, Vec<&Edit>> = BTreeMap::new();
    for edit in &edits {
        by_path.entry(edit.path.as_str()).or_default().push(edit);
    }
    for (path, file_edits) in &by_path {
        cancel.check()?;
        let content = sources.get(path)?;
        let after = apply_edits(content, file_edits)?;
        if let Some(file) = ctx.snapshot.get(path) {
            let technology = file.record.technology;
            let before_errors =
                malformed_regions(content, &mask_source(content, technology), technology).len();
            let after_errors =
                malformed_regions(&after, &mask_source(&after, technology), technology).len();
            if after_errors > before_errors {
                warnings.push(format!(
                    "edit introduces {} new syntax error(s) in {path}",
                    after_errors - before_errors
                ));
                penalties += 3;
            }
            base_hashes.insert(path.to_string(), file.record.content_hash.clone());
        }
    }

    let cyclic: Vec<&String> = target_paths.iter().filter(|p| ctx.graph.in_cycle(p)).collect();
    for path in &cyclic {
        warnings.push(format!("{path} is part of an import cycle"));
    }
    if !cyclic.is_empty() {
        penalties += 2;
    }

    let mut affected: BTreeSet<String> = target_paths
        .iter()
        .flat_map(|p| ctx.graph.dependents_of(p))
        .collect();
    affected.extend(references);
    affected.extend(referencing);
    affected.retain(|p| !target_paths.contains(p));

    let mut seeds = affected.clone();
    seeds.extend(target_paths.iter().cloned());
    let transitive: Vec<String> = ctx
        .graph
        .transitive_dependents(&seeds, ctx.max_impact_depth)
        .into_keys()
        .collect();

    let risk = risk_level(affected.len(), transitive.len(), penalties);
    let created_at: DateTime<Utc> = SystemTime::now().into();
    let id = plan_id(ctx.snapshot.generation(), &target, &intent, &created_at)?;

    debug!(plan_id = %id, edits = edits.len(), "plan computed");
    info!(
        plan_id = %id,
        target = %target,
        risk = ?risk,
        affected = affected.len(),
        "refactor planned"
    );

    Ok(RefactorPlan {
        id,
        target,
        intent,
        symbol: symbol_id,
        edits,
        risk,
        affected_files: affected.into_iter().collect(),
        transitive_dependents: transitive,
        warnings,
        generation: ctx.snapshot.generation(),
        created_at,
        base_hashes,
    })
}

fn plan_id(
    generation: u64,
    target: &RefactorTarget,
    intent: &RefactorIntent,
    created_at: &DateTime<Utc>,
) -> RefractResult<String> {
    let mut hasher = Sha256::new();
    hasher.update(generation.to_le_bytes());
    hasher.update(serde_json::to_vec(target)?);
    hasher.update(serde_json::to_vec(intent)?);
    hasher.update(created_at.to_rfc3339().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Ok(digest[..PLAN_ID_LEN].to_string())
}
