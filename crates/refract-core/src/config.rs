//! Engine configuration: defaults, an optional JSON file, then `REFRACT_*`
//! environment overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{RefractError, RefractResult};
use crate::indexer::filesystem::FilterConfig;
use crate::indexer::pipeline::MAX_WORKERS;
use crate::query::guards::{
    clamp_depth, clamp_int, clamp_threshold, env_flag, DEFAULT_IMPACT_DEPTH,
    DEFAULT_PLAN_TTL_SECS, MAX_IMPACT_DEPTH, MAX_PLAN_TTL_SECS, MIN_PLAN_TTL_SECS,
};
use crate::query::patterns::{Rule, RuleSet};
use crate::query::quality::MetricWeights;
use crate::refactor::backup::DEFAULT_BACKUP_DIR;

pub const ENV_WORKERS: &str = "REFRACT_WORKERS";
pub const ENV_BACKUP_DIR: &str = "REFRACT_BACKUP_DIR";
pub const ENV_PLAN_TTL_SECS: &str = "REFRACT_PLAN_TTL_SECS";
pub const ENV_RESPECT_GITIGNORE: &str = "REFRACT_RESPECT_GITIGNORE";
pub const ENV_FOLLOW_SYMLINKS: &str = "REFRACT_FOLLOW_SYMLINKS";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Parser threads for indexing passes.
    pub workers: usize,
    pub filter: FilterConfig,
    pub weights: MetricWeights,
    /// Relative paths are resolved against the project root.
    pub backup_dir: PathBuf,
    pub plan_ttl_secs: u64,
    pub max_impact_depth: usize,
    pub rules: RuleSet,
}

impl Default for Config {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            workers: clamp_int(workers, 1, MAX_WORKERS),
            filter: FilterConfig::default(),
            weights: MetricWeights::default(),
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            plan_ttl_secs: DEFAULT_PLAN_TTL_SECS,
            max_impact_depth: DEFAULT_IMPACT_DEPTH,
            rules: RuleSet::default(),
        }
    }
}

impl Config {
    /// Defaults overlaid with the JSON file; missing keys keep their default.
    pub fn from_file(path: &Path) -> RefractResult<Self> {
        if !path.exists() {
            return Err(RefractError::PathNotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| RefractError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "config loaded");
        Ok(config.normalized())
    }

    /// `Config::default()` or the file, then environment overrides.
    pub fn load(path: Option<&Path>) -> RefractResult<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        base.with_env_overrides()
    }

    pub fn with_env_overrides(self) -> RefractResult<Self> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env<F>(mut self, lookup: F) -> RefractResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_WORKERS) {
            self.workers = parse_number(ENV_WORKERS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_BACKUP_DIR) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                self.backup_dir = PathBuf::from(trimmed);
            }
        }
        if let Some(raw) = lookup(ENV_PLAN_TTL_SECS) {
            self.plan_ttl_secs = parse_number(ENV_PLAN_TTL_SECS, &raw)?;
        }
        self.filter.respect_gitignore = env_flag(
            lookup(ENV_RESPECT_GITIGNORE).as_deref(),
            self.filter.respect_gitignore,
        );
        self.filter.follow_symlinks = env_flag(
            lookup(ENV_FOLLOW_SYMLINKS).as_deref(),
            self.filter.follow_symlinks,
        );
        Ok(self.normalized())
    }

    /// Clamp every bound into its guarded range.
    pub fn normalized(mut self) -> Self {
        self.workers = clamp_int(self.workers, 1, MAX_WORKERS);
        self.plan_ttl_secs = clamp_int(self.plan_ttl_secs, MIN_PLAN_TTL_SECS, MAX_PLAN_TTL_SECS);
        self.max_impact_depth = clamp_depth(self.max_impact_depth, MAX_IMPACT_DEPTH);
        for rule in &mut self.rules.rules {
            match rule {
                Rule::GodClass { max_methods: n }
                | Rule::LongFunction { max_lines: n }
                | Rule::HubModule { min_dependents: n } => *n = clamp_threshold(*n),
                Rule::ComplexFunction { max_complexity: n }
                | Rule::DeepNesting { max_depth: n } => {
                    *n = clamp_threshold(*n as usize) as u32;
                }
                _ => {}
            }
        }
        self
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> RefractResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| RefractError::Config(format!("{key} must be a non-negative integer, got `{raw}`")))
}
