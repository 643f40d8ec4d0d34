//! SQLite schema DDL and migration framework for snapshot exports.

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::errors::RefractResult;

/// Version written by a fully migrated export database.
pub const SCHEMA_VERSION: i32 = 2;

/// Export tables and their indexes. Every statement is `IF NOT EXISTS`.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS repo_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        applied_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        technology TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        line_count INTEGER NOT NULL,
        parse_status TEXT NOT NULL,
        parse_error TEXT,
        centrality REAL DEFAULT 0.0
    );",
    "CREATE TABLE IF NOT EXISTS declarations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symbol_key INTEGER NOT NULL,
        file_path TEXT NOT NULL REFERENCES files(path) ON DELETE CASCADE,
        name TEXT NOT NULL,
        qualified_name TEXT NOT NULL,
        kind TEXT NOT NULL,
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        complexity INTEGER NOT NULL,
        max_nesting INTEGER NOT NULL,
        parent_qualified_name TEXT,
        UNIQUE(file_path, qualified_name)
    );",
    "CREATE TABLE IF NOT EXISTS imports (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_path TEXT NOT NULL REFERENCES files(path) ON DELETE CASCADE,
        module TEXT NOT NULL,
        line INTEGER NOT NULL,
        raw TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS file_edges (
        source TEXT NOT NULL,
        target TEXT NOT NULL,
        kind TEXT NOT NULL,
        line INTEGER NOT NULL,
        PRIMARY KEY(source, target, kind, line)
    );",
    "CREATE TABLE IF NOT EXISTS symbol_edges (
        source_id INTEGER NOT NULL,
        target_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        line INTEGER NOT NULL,
        PRIMARY KEY(source_id, target_id, kind, line)
    );",
    "CREATE TABLE IF NOT EXISTS unresolved_imports (
        file_path TEXT NOT NULL,
        module TEXT NOT NULL,
        line INTEGER NOT NULL,
        reason TEXT NOT NULL,
        detail TEXT
    );",
    "CREATE TABLE IF NOT EXISTS cycles (
        group_id INTEGER NOT NULL,
        file_path TEXT NOT NULL,
        PRIMARY KEY(group_id, file_path)
    );",
    "CREATE TABLE IF NOT EXISTS backups (
        backup_path TEXT PRIMARY KEY,
        original TEXT NOT NULL,
        created_at TEXT NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_declarations_file ON declarations(file_path);",
    "CREATE INDEX IF NOT EXISTS idx_declarations_key ON declarations(symbol_key);",
    "CREATE INDEX IF NOT EXISTS idx_imports_file ON imports(file_path);",
    "CREATE INDEX IF NOT EXISTS idx_file_edges_target ON file_edges(target);",
    "CREATE INDEX IF NOT EXISTS idx_symbol_edges_target ON symbol_edges(target_id);",
    "CREATE INDEX IF NOT EXISTS idx_backups_original ON backups(original);",
];

// ─── Migrations ─────────────────────────────────────────────────────────────

type Step = fn(&Connection) -> RefractResult<()>;

/// `(version reached, step)` in ascending order.
const MIGRATIONS: &[(i32, Step)] = &[(1, baseline), (2, add_file_centrality)];

/// Bring the database to [`SCHEMA_VERSION`]. Each step runs under its own
/// savepoint; a failed step is rolled back, logged to `migration_history`
/// and returned, leaving earlier steps committed.
pub fn migrate_schema(conn: &Connection) -> RefractResult<()> {
    let start = get_schema_version(conn);
    for &(target, step) in MIGRATIONS.iter().filter(|(v, _)| *v > start) {
        let from = target - 1;
        conn.execute_batch("SAVEPOINT refract_migrate_step;")?;
        let outcome = step(conn)
            .and_then(|()| set_schema_version(conn, target))
            .and_then(|()| log_step(conn, from, target, None));
        match outcome {
            Ok(()) => conn.execute_batch("RELEASE SAVEPOINT refract_migrate_step;")?,
            Err(err) => {
                let _ = conn.execute_batch(
                    "ROLLBACK TO SAVEPOINT refract_migrate_step; \
                     RELEASE SAVEPOINT refract_migrate_step;",
                );
                let _ = log_step(conn, from, target, Some(&err.to_string()));
                warn!(from, to = target, error = %err, "schema migration failed");
                return Err(err);
            }
        }
        debug!(version = target, "schema migrated");
    }
    Ok(())
}

/// Stored schema version; 0 for a fresh or unreadable database.
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT value FROM repo_meta WHERE key = 'schema_version';",
        [],
        |row| row.get::<_, String>(0),
    )
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(0)
}

fn set_schema_version(conn: &Connection, version: i32) -> RefractResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO repo_meta(key, value) VALUES('schema_version', ?1);",
        [version.to_string()],
    )?;
    Ok(())
}

fn log_step(conn: &Connection, from: i32, to: i32, error: Option<&str>) -> RefractResult<()> {
    let status = if error.is_some() { "failed" } else { "success" };
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         SELECT ?1, ?2, ?3, ?4;",
        rusqlite::params![from, to, status, error],
    )?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> RefractResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn baseline(_conn: &Connection) -> RefractResult<()> {
    Ok(())
}

/// Exports written before centrality was stored lack the column.
fn add_file_centrality(conn: &Connection) -> RefractResult<()> {
    if !has_column(conn, "files", "centrality")? {
        conn.execute_batch("ALTER TABLE files ADD COLUMN centrality REAL DEFAULT 0.0;")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        conn
    }

    #[test]
    fn test_schema_statement_counts() {
        assert_eq!(SCHEMA_STATEMENTS.len(), 16);
    }

    #[test]
    fn test_migrate_fresh_database() {
        let conn = fresh();
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
        let steps: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM migration_history WHERE status = 'success';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(steps, SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_migrate_idempotent() {
        let conn = fresh();
        migrate_schema(&conn).unwrap();
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn test_v2_adds_centrality_to_old_files_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE repo_meta (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE migration_history (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 from_version INTEGER NOT NULL,
                 to_version INTEGER NOT NULL,
                 status TEXT NOT NULL,
                 error_message TEXT,
                 applied_at TEXT DEFAULT CURRENT_TIMESTAMP
             );
             CREATE TABLE files (path TEXT PRIMARY KEY, technology TEXT NOT NULL);
             INSERT INTO repo_meta(key, value) VALUES('schema_version', '1');",
        )
        .unwrap();
        assert!(!has_column(&conn, "files", "centrality").unwrap());
        migrate_schema(&conn).unwrap();
        assert!(has_column(&conn, "files", "centrality").unwrap());
        assert_eq!(get_schema_version(&conn), 2);
    }
}
