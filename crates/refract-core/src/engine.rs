//! Engine: the operation surface over one project root.
//!
//! Owns the project index, a dependency graph kept current incrementally,
//! the registry of refactor plans and the write-side machinery (locks,
//! backups, file sink). Every result type is `Serialize` so a dispatch
//! layer can hand it out as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::{RefractError, RefractResult};
use crate::indexer::filesystem::FilterConfig;
use crate::indexer::graph::{self, DependencyGraph, GraphView};
use crate::indexer::pipeline::{self, CancellationToken, IndexSummary};
use crate::models::Scope;
use crate::query::dependencies::{self, FileDependencies};
use crate::query::patterns::{find_patterns_in, PatternMatch, PatternReport, RuleSet};
use crate::query::quality::{quality_report, QualityReport};
use crate::query::references::{self, SymbolReferences};
use crate::query::suggest::{suggest_refactorings, SuggestionReport};
use crate::query::usages::{find_usages, UsageReport};
use crate::refactor::apply::{self, ApplyContext, ApplyReport};
use crate::refactor::backup::{BackupRecord, BackupStore};
use crate::refactor::diff::{self, Diff};
use crate::refactor::fs::{AtomicFileSink, FileSink, FsReader};
use crate::refactor::locks::PathLocks;
use crate::refactor::plan::{
    self, PlanContext, PlanState, RefactorIntent, RefactorPlan, RefactorTarget,
};
use crate::store::database::{Database, ExportSummary};
use crate::store::index::{IndexSnapshot, ProjectIndex};

/// Plans kept in the registry; the oldest finished plans go first.
pub const MAX_PLANS: usize = 256;

struct PlanEntry {
    plan: Arc<RefactorPlan>,
    state: PlanState,
}

/// A plan and its current state, as reported to callers.
#[derive(Clone, Debug, Serialize)]
pub struct PlanStatus {
    pub plan: RefactorPlan,
    pub state: PlanState,
}

type Analysis = (Arc<IndexSnapshot>, Arc<DependencyGraph>);

pub struct Engine {
    root: PathBuf,
    config: Config,
    index: ProjectIndex,
    analysis: Mutex<Option<Analysis>>,
    plans: Mutex<IndexMap<String, PlanEntry>>,
    locks: PathLocks,
    backups: BackupStore,
    reader: FsReader,
    sink: Box<dyn FileSink>,
}

impl Engine {
    pub fn new(root: impl AsRef<Path>, config: Config) -> RefractResult<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(RefractError::PathNotFound(root.to_path_buf()));
        }
        let root = root.canonicalize()?;
        let config = config.normalized();
        info!(root = %root.display(), workers = config.workers, "engine opened");
        Ok(Self {
            backups: BackupStore::new(&root, &config.backup_dir),
            reader: FsReader::new(&root),
            sink: Box::new(AtomicFileSink::new(&root)),
            index: ProjectIndex::new(),
            analysis: Mutex::new(None),
            plans: Mutex::new(IndexMap::new()),
            locks: PathLocks::new(),
            root,
            config,
        })
    }

    /// Replace the sink every apply writes through.
    pub fn with_sink(mut self, sink: Box<dyn FileSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.index.snapshot()
    }

    // -----------------------------------------------------------------------
    // Indexing and analysis
    // -----------------------------------------------------------------------

    /// Index `paths` (all of the root when empty).
    pub fn index_paths(
        &self,
        paths: &[PathBuf],
        filter: &FilterConfig,
        cancel: &CancellationToken,
    ) -> RefractResult<IndexSummary> {
        pipeline::index_paths(
            &self.index,
            &self.root,
            paths,
            filter,
            self.config.workers,
            cancel,
        )
    }

    /// The current snapshot with a graph built for exactly that snapshot.
    fn analysis(&self) -> Analysis {
        let snapshot = self.index.snapshot();
        let mut cached = self.analysis.lock();
        let graph = match cached.as_ref() {
            Some((seen, graph)) if seen.generation() == snapshot.generation() => {
                return (snapshot, Arc::clone(graph));
            }
            Some((seen, previous)) => {
                let changed = snapshot.changed_since(seen);
                debug!(changed = changed.len(), "updating dependency graph");
                graph::update(previous, &snapshot, &changed)
            }
            None => graph::build(&snapshot),
        };
        let graph = Arc::new(graph);
        *cached = Some((Arc::clone(&snapshot), Arc::clone(&graph)));
        (snapshot, graph)
    }

    pub fn dependency_graph(&self, scope: &Scope) -> GraphView {
        self.analysis().1.view(scope)
    }

    /// Run `rules`, or the configured rule set when `None`.
    pub fn find_patterns(&self, scope: &Scope, rules: Option<&RuleSet>) -> PatternReport {
        let (snapshot, graph) = self.analysis();
        find_patterns_in(
            &snapshot,
            &graph,
            rules.unwrap_or(&self.config.rules),
            scope,
        )
    }

    pub fn quality(&self, scope: &Scope) -> QualityReport {
        quality_report(&self.index.snapshot(), scope, &self.config.weights)
    }

    /// Declarations called `name`, optionally under `path`, with every site
    /// that refers to each.
    pub fn find_references(
        &self,
        name: &str,
        path: Option<&str>,
    ) -> RefractResult<Vec<SymbolReferences>> {
        let (snapshot, graph) = self.analysis();
        references::find_references(&snapshot, &graph, name, path)
    }

    pub fn file_dependencies(&self, path: &str) -> RefractResult<FileDependencies> {
        let (snapshot, graph) = self.analysis();
        dependencies::file_dependencies(&snapshot, &graph, path)
    }

    /// Occurrences of `text` in code under `scope`, classified and with the
    /// impact of editing the files they are in.
    pub fn find_pattern_usages(&self, text: &str, scope: &Scope) -> RefractResult<UsageReport> {
        let (snapshot, graph) = self.analysis();
        find_usages(
            &snapshot,
            &graph,
            &self.reader,
            text,
            scope,
            self.config.max_impact_depth,
        )
    }

    /// Suggestions from the configured rules and the quality metrics of one
    /// snapshot.
    pub fn suggest_refactorings(&self, scope: &Scope) -> SuggestionReport {
        let (snapshot, graph) = self.analysis();
        let patterns = find_patterns_in(&snapshot, &graph, &self.config.rules, scope);
        let quality = quality_report(&snapshot, scope, &self.config.weights);
        suggest_refactorings(&patterns, &quality)
    }

    // -----------------------------------------------------------------------
    // Refactoring
    // -----------------------------------------------------------------------

    pub fn plan_refactor(
        &self,
        target: RefactorTarget,
        intent: RefactorIntent,
        cancel: &CancellationToken,
    ) -> RefractResult<String> {
        let (snapshot, graph) = self.analysis();
        let report: PatternReport;
        let matches: &[PatternMatch] = if matches!(target, RefactorTarget::Match { .. }) {
            report = find_patterns_in(&snapshot, &graph, &self.config.rules, &Scope::all());
            &report.matches
        } else {
            &[]
        };
        let ctx = PlanContext {
            snapshot: &snapshot,
            graph: &graph,
            reader: &self.reader,
            max_impact_depth: self.config.max_impact_depth,
            matches,
        };
        let planned = plan::plan(target, intent, &ctx, cancel)?;
        let id = planned.id.clone();
        let state = PlanState::Requested.transition(PlanState::Planned, &id)?;

        let mut plans = self.plans.lock();
        plans.insert(
            id.clone(),
            PlanEntry {
                plan: Arc::new(planned),
                state,
            },
        );
        evict_plans(&mut plans);
        Ok(id)
    }

    pub fn plan_state(&self, plan_id: &str) -> RefractResult<PlanState> {
        self.plans
            .lock()
            .get(plan_id)
            .map(|entry| entry.state)
            .ok_or_else(|| RefractError::UnknownPlan(plan_id.to_string()))
    }

    pub fn plan_status(&self, plan_id: &str) -> RefractResult<PlanStatus> {
        self.plans
            .lock()
            .get(plan_id)
            .map(|entry| PlanStatus {
                plan: (*entry.plan).clone(),
                state: entry.state,
            })
            .ok_or_else(|| RefractError::UnknownPlan(plan_id.to_string()))
    }

    pub fn preview_refactor(&self, plan_id: &str) -> RefractResult<Diff> {
        let plan = self.live_plan(plan_id, PlanState::PreviewReady)?;
        let diff = diff::preview(&plan.id, &plan.edits, &self.reader)?;
        self.set_state(plan_id, PlanState::PreviewReady)?;
        Ok(diff)
    }

    /// Apply a previewed plan, then re-index the files it wrote.
    pub fn apply_refactor(&self, plan_id: &str) -> RefractResult<ApplyReport> {
        let plan = self.live_plan(plan_id, PlanState::Applied)?;
        let ctx = ApplyContext {
            reader: &self.reader,
            sink: self.sink.as_ref(),
            backups: &self.backups,
            locks: &self.locks,
        };
        match apply::apply(&plan, &ctx) {
            Ok(report) => {
                self.set_state(plan_id, PlanState::Applied)?;
                self.reindex(&report.files_written);
                Ok(report)
            }
            Err(err) => {
                match &err {
                    RefractError::PlanExpired { .. } => {
                        self.settle(plan_id, PlanState::Expired);
                    }
                    RefractError::PartialApplyFailure { succeeded, .. } => {
                        self.settle(plan_id, PlanState::Rejected);
                        self.reindex(succeeded);
                    }
                    _ => {}
                }
                Err(err)
            }
        }
    }

    pub fn reject_refactor(&self, plan_id: &str) -> RefractResult<()> {
        self.set_state(plan_id, PlanState::Rejected)?;
        info!(plan_id, "refactor rejected");
        Ok(())
    }

    /// The plan, if it may move to `next` and has not expired. An expired
    /// plan is marked `Expired` and reported as `PlanExpired`.
    fn live_plan(&self, plan_id: &str, next: PlanState) -> RefractResult<Arc<RefactorPlan>> {
        let mut plans = self.plans.lock();
        let entry = plans
            .get_mut(plan_id)
            .ok_or_else(|| RefractError::UnknownPlan(plan_id.to_string()))?;
        entry.state.transition(next, plan_id)?;
        if let Some(reason) = self.expiry_reason(&entry.plan) {
            entry.state = entry.state.transition(PlanState::Expired, plan_id)?;
            info!(plan_id, %reason, "refactor plan expired");
            return Err(RefractError::PlanExpired {
                plan_id: plan_id.to_string(),
                reason,
            });
        }
        Ok(Arc::clone(&entry.plan))
    }

    fn expiry_reason(&self, plan: &RefactorPlan) -> Option<String> {
        let generation = self.index.generation();
        if generation != plan.generation {
            return Some(format!(
                "index advanced from generation {} to {generation}",
                plan.generation
            ));
        }
        let now: DateTime<Utc> = SystemTime::now().into();
        let age = now.signed_duration_since(plan.created_at).num_seconds();
        if age > self.config.plan_ttl_secs as i64 {
            return Some(format!(
                "older than {} seconds",
                self.config.plan_ttl_secs
            ));
        }
        None
    }

    fn set_state(&self, plan_id: &str, next: PlanState) -> RefractResult<()> {
        let mut plans = self.plans.lock();
        let entry = plans
            .get_mut(plan_id)
            .ok_or_else(|| RefractError::UnknownPlan(plan_id.to_string()))?;
        entry.state = entry.state.transition(next, plan_id)?;
        Ok(())
    }

    /// Move a plan into a terminal state after a failed apply. The apply
    /// error is what the caller sees, so a refused transition is only logged.
    fn settle(&self, plan_id: &str, next: PlanState) {
        if let Err(err) = self.set_state(plan_id, next) {
            warn!(plan_id, state = %next, error = %err, "plan state not updated after failed apply");
        }
    }

    fn reindex(&self, paths: &[String]) {
        if paths.is_empty() {
            return;
        }
        let inputs: Vec<PathBuf> = paths.iter().map(PathBuf::from).collect();
        if let Err(err) = self.index_paths(&inputs, &self.config.filter, &CancellationToken::new()) {
            warn!(error = %err, "re-index after write failed");
        }
    }

    // -----------------------------------------------------------------------
    // Backups and export
    // -----------------------------------------------------------------------

    pub fn backups(&self) -> RefractResult<Vec<BackupRecord>> {
        self.backups.list()
    }

    /// Restore a backup under the same per-path lock an apply takes.
    pub fn restore_backup(&self, record: &BackupRecord) -> RefractResult<()> {
        let guard = self.locks.try_lock_all([record.original.as_str()])?;
        self.backups.restore(record)?;
        drop(guard);
        self.reindex(std::slice::from_ref(&record.original));
        Ok(())
    }

    pub fn cleanup_backup(&self, record: &BackupRecord) -> RefractResult<()> {
        self.backups.cleanup(record)
    }

    /// Write the current generation and the backup journal to SQLite.
    pub fn export_snapshot(&self, db_path: impl AsRef<Path>) -> RefractResult<ExportSummary> {
        let (snapshot, graph) = self.analysis();
        let db = Database::open(db_path)?;
        db.init_schema()?;
        let summary = db.write_snapshot(&snapshot, &graph)?;
        db.record_backups(&self.backups.list()?)?;
        Ok(summary)
    }
}

/// Drop finished plans oldest-first, then the oldest of any state, until the
/// registry fits.
fn evict_plans(plans: &mut IndexMap<String, PlanEntry>) {
    while plans.len() > MAX_PLANS {
        match plans.iter().position(|(_, entry)| entry.state.is_terminal()) {
            Some(index) => {
                plans.shift_remove_index(index);
            }
            None => {
                plans.shift_remove_index(0);
            }
        }
    }
}
