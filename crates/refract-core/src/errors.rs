//! Error types for the refract core library.

use std::path::PathBuf;

/// Top-level error enum for the refract core library.
#[derive(Debug, thiserror::Error)]
pub enum RefractError {
    #[error("Path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("Parse failure in {path}: {reason}")]
    ParseFailure { path: String, reason: String },

    #[error("Unresolved import `{module}` in {path}")]
    UnresolvedImport { path: String, module: String },

    #[error("Unresolved refactor target: {0}")]
    UnresolvedTarget(String),

    #[error("Invalid refactor intent: {0}")]
    InvalidIntent(String),

    #[error(
        "Apply failed at {failed_path}: {cause} ({} written, {} rolled back, {} rollback failures)",
        .succeeded.len(),
        .rolled_back.len(),
        .rollback_failures.len()
    )]
    PartialApplyFailure {
        failed_path: String,
        cause: String,
        succeeded: Vec<String>,
        rolled_back: Vec<String>,
        rollback_failures: Vec<String>,
    },

    #[error("Concurrent write conflict on {0}")]
    ConcurrentWriteConflict(String),

    #[error("Plan {plan_id} is {actual}, expected {expected}")]
    InvalidPlanState {
        plan_id: String,
        expected: String,
        actual: String,
    },

    #[error("Plan {plan_id} expired: {reason}")]
    PlanExpired { plan_id: String, reason: String },

    #[error("Unknown plan: {0}")]
    UnknownPlan(String),

    #[error("Rule `{rule}` failed: {message}")]
    Rule { rule: String, message: String },

    #[error("Invalid query: {0}")]
    Query(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type RefractResult<T> = Result<T, RefractError>;
