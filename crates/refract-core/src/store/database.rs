//! SQLite export of one index generation plus a journal of backups.
//!
//! The export is a read model for other tools. It is rewritten wholesale on
//! every `write_snapshot`; the in-memory index stays the source of truth.
//! Each public method opens its own connection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::errors::{RefractError, RefractResult};
use crate::indexer::graph::DependencyGraph;
use crate::indexer::imports::UnresolvedReason;
use crate::models::{Declaration, ParseStatus, SymbolId};
use crate::refactor::backup::BackupRecord;
use crate::store::index::IndexSnapshot;
use crate::store::schema;

// ---------------------------------------------------------------------------
// Helper: tilde expansion
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if text == "~" || text.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if text.len() > 2 {
                expanded.push(&text[2..]);
            }
            return expanded;
        }
    }
    path.to_path_buf()
}

/// Row counts of one export.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub generation: u64,
    pub files: usize,
    pub declarations: usize,
    pub imports: usize,
    pub file_edges: usize,
    pub symbol_edges: usize,
    pub unresolved_imports: usize,
    pub cycle_groups: usize,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Resolve the path (expanding `~`) and create parent directories.
    pub fn open(db_path: impl AsRef<Path>) -> RefractResult<Self> {
        let expanded = expand_tilde(db_path.as_ref());
        let resolved = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()?.join(&expanded)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { db_path: resolved })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> RefractResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    pub fn init_schema(&self) -> RefractResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&conn)?;
        Ok(())
    }

    /// Replace the exported generation with `snapshot` and its graph, in one
    /// transaction.
    pub fn write_snapshot(
        &self,
        snapshot: &IndexSnapshot,
        graph: &DependencyGraph,
    ) -> RefractResult<ExportSummary> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM symbol_edges;
             DELETE FROM file_edges;
             DELETE FROM unresolved_imports;
             DELETE FROM cycles;
             DELETE FROM imports;
             DELETE FROM declarations;
             DELETE FROM files;",
        )?;

        let mut summary = ExportSummary {
            generation: snapshot.generation(),
            ..ExportSummary::default()
        };
        let mut row_ids: HashMap<SymbolId, i64> = HashMap::new();
        {
            let mut file_stmt = tx.prepare(
                "INSERT INTO files ( \
                     path, technology, content_hash, size_bytes, line_count, \
                     parse_status, parse_error, centrality \
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            )?;
            let mut decl_stmt = tx.prepare(
                "INSERT OR IGNORE INTO declarations ( \
                     symbol_key, file_path, name, qualified_name, kind, start_line, \
                     end_line, complexity, max_nesting, parent_qualified_name \
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            )?;
            let mut import_stmt = tx.prepare(
                "INSERT INTO imports(file_path, module, line, raw) VALUES (?1, ?2, ?3, ?4);",
            )?;

            for (path, file) in snapshot.files() {
                let record = &file.record;
                let (status, error) = match &record.status {
                    ParseStatus::Unparsed => ("unparsed", None),
                    ParseStatus::Parsed => ("parsed", None),
                    ParseStatus::ParseFailed { reason } => ("parse_failed", Some(reason.as_str())),
                };
                file_stmt.execute(params![
                    path,
                    record.technology.as_str(),
                    record.content_hash,
                    record.size_bytes as i64,
                    record.line_count as i64,
                    status,
                    error,
                    graph.centrality.get(path).copied().unwrap_or(0.0),
                ])?;
                summary.files += 1;

                let mut stack: Vec<(&Declaration, Option<&str>)> = file
                    .unit
                    .declarations
                    .iter()
                    .rev()
                    .map(|d| (d, None))
                    .collect();
                while let Some((decl, parent)) = stack.pop() {
                    let id = SymbolId::new(path.as_str(), decl.qualified_name.as_str());
                    let inserted = decl_stmt.execute(params![
                        id.numeric(),
                        path,
                        decl.name,
                        decl.qualified_name,
                        decl.kind.as_str(),
                        decl.span.start_line as i64,
                        decl.span.end_line as i64,
                        decl.complexity,
                        decl.max_nesting,
                        parent,
                    ])?;
                    if inserted > 0 {
                        row_ids.insert(id, tx.last_insert_rowid());
                        summary.declarations += 1;
                    }
                    for child in decl.children.iter().rev() {
                        stack.push((child, Some(decl.qualified_name.as_str())));
                    }
                }

                for import in &file.unit.imports {
                    import_stmt.execute(params![
                        path,
                        import.module,
                        import.span.start_line as i64,
                        import.raw,
                    ])?;
                    summary.imports += 1;
                }
            }
        }

        {
            let mut edge_stmt = tx.prepare(
                "INSERT OR IGNORE INTO file_edges(source, target, kind, line) \
                 VALUES (?1, ?2, ?3, ?4);",
            )?;
            for edge in &graph.file_edges {
                summary.file_edges += edge_stmt.execute(params![
                    edge.source,
                    edge.target,
                    edge.kind.as_str(),
                    edge.line as i64,
                ])?;
            }

            let mut symbol_stmt = tx.prepare(
                "INSERT OR IGNORE INTO symbol_edges(source_id, target_id, kind, line) \
                 VALUES (?1, ?2, ?3, ?4);",
            )?;
            for edge in &graph.symbol_edges {
                let (Some(source), Some(target)) =
                    (row_ids.get(&edge.source), row_ids.get(&edge.target))
                else {
                    continue;
                };
                summary.symbol_edges += symbol_stmt.execute(params![
                    source,
                    target,
                    edge.kind.as_str(),
                    edge.line as i64,
                ])?;
            }

            let mut unresolved_stmt = tx.prepare(
                "INSERT INTO unresolved_imports(file_path, module, line, reason, detail) \
                 VALUES (?1, ?2, ?3, ?4, ?5);",
            )?;
            for unresolved in &graph.unresolved {
                let (reason, detail) = match &unresolved.reason {
                    UnresolvedReason::NotFound => ("not_found", None),
                    UnresolvedReason::Ambiguous { candidates } => {
                        ("ambiguous", Some(candidates.join(",")))
                    }
                    UnresolvedReason::External => ("external", None),
                };
                unresolved_stmt.execute(params![
                    unresolved.path,
                    unresolved.module,
                    unresolved.line as i64,
                    reason,
                    detail,
                ])?;
                summary.unresolved_imports += 1;
            }

            let mut cycle_stmt =
                tx.prepare("INSERT INTO cycles(group_id, file_path) VALUES (?1, ?2);")?;
            for (group_id, group) in graph.cycles.iter().enumerate() {
                for path in group {
                    cycle_stmt.execute(params![group_id as i64, path])?;
                }
                summary.cycle_groups += 1;
            }
        }

        set_meta(&tx, "generation", &snapshot.generation().to_string())?;
        let exported_at: DateTime<Utc> = std::time::SystemTime::now().into();
        set_meta(&tx, "exported_at", &exported_at.to_rfc3339())?;
        tx.commit()?;

        info!(
            db = %self.db_path.display(),
            generation = summary.generation,
            files = summary.files,
            declarations = summary.declarations,
            "snapshot exported"
        );
        Ok(summary)
    }

    /// Generation of the last export, if any.
    pub fn exported_generation(&self) -> RefractResult<Option<u64>> {
        let conn = self.connect()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM repo_meta WHERE key = 'generation';",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    /// Journal backup records; already-journaled paths are skipped.
    pub fn record_backups(&self, records: &[BackupRecord]) -> RefractResult<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO backups(backup_path, original, created_at) \
                 VALUES (?1, ?2, ?3);",
            )?;
            for record in records {
                inserted += stmt.execute(params![
                    record.backup_path.to_string_lossy(),
                    record.original,
                    record.timestamp.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn list_backups(&self) -> RefractResult<Vec<BackupRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT backup_path, original, created_at FROM backups \
             ORDER BY original, created_at;",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (backup_path, original, created_at) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| RefractError::Config(format!("bad backup timestamp `{created_at}`: {e}")))?
                .with_timezone(&Utc);
            records.push(BackupRecord {
                original,
                backup_path: PathBuf::from(backup_path),
                timestamp,
            });
        }
        Ok(records)
    }
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> RefractResult<()> {
    conn.execute(
        "INSERT INTO repo_meta(key, value) VALUES(?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![key, value],
    )?;
    Ok(())
}
