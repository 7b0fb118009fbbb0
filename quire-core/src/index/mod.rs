//! Derived composition index with SQLite FTS5
//!
//! The index mirrors the markdown files for lookup and full-text search. It
//! is authoritative for nothing and can always be regenerated from the
//! files (see [`crate::sync`]).

mod schema;

use crate::record::{Composition, ContentUpdate};
use crate::timestamp::{format_timestamp, parse_timestamp};
use crate::QuireError;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Params, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(5 * 60);
const MAX_CONNECTION_IDLE: Duration = Duration::from_secs(2 * 60);

const INSERT_SQL: &str = "INSERT INTO compositions \
     (file_path, created_at, working_directory, content, character_count, line_count, updated_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

const UPDATE_SQL: &str = "UPDATE compositions \
     SET content = ?1, character_count = ?2, line_count = ?3, updated_at = ?4 \
     WHERE file_path = ?5";

const SELECT_BY_PATH_SQL: &str = "SELECT id, file_path, created_at, working_directory, content, \
     character_count, line_count, updated_at \
     FROM compositions WHERE file_path = ?1";

const SELECT_ALL_SQL: &str = "SELECT id, file_path, created_at, working_directory, content, \
     character_count, line_count, updated_at \
     FROM compositions";

const SELECT_BY_DIRECTORY_SQL: &str = "SELECT id, file_path, created_at, working_directory, content, \
     character_count, line_count, updated_at \
     FROM compositions WHERE working_directory = ?1";

const DELETE_SQL: &str = "DELETE FROM compositions WHERE file_path = ?1";

const SEARCH_SQL: &str = "SELECT c.id, c.file_path, c.created_at, c.working_directory, c.content, \
     c.character_count, c.line_count, c.updated_at \
     FROM compositions c \
     JOIN compositions_fts fts ON c.id = fts.rowid \
     WHERE compositions_fts MATCH ?1";

const EXISTS_SQL: &str = "SELECT COUNT(*) FROM compositions WHERE file_path = ?1";

const COUNT_SQL: &str = "SELECT COUNT(*) FROM compositions";

/// Compiled into every pooled connection's statement cache when it opens.
const PREPARED_STATEMENTS: &[&str] = &[
    INSERT_SQL,
    UPDATE_SQL,
    SELECT_BY_PATH_SQL,
    SELECT_ALL_SQL,
    SELECT_BY_DIRECTORY_SQL,
    DELETE_SQL,
    SEARCH_SQL,
    EXISTS_SQL,
    COUNT_SQL,
];

/// Composition index backed by a small SQLite connection pool
pub struct SearchIndex {
    db_path: PathBuf,
    pool: Pool<SqliteConnectionManager>,
}

impl SearchIndex {
    /// Open or create the index database at `db_path`.
    ///
    /// The schema is created through a dedicated connection before the pool
    /// starts, so pooled connections can pre-compile their statements.
    pub fn open(db_path: &Path, max_connections: u32) -> crate::Result<Self> {
        info!(path = %db_path.display(), "Initializing history index");

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QuireError::storage(parent, e))?;
        }

        {
            let conn = Connection::open(db_path)?;
            schema::init_schema(&conn)?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
            conn.set_prepared_statement_cache_capacity(PREPARED_STATEMENTS.len() + 4);
            for sql in PREPARED_STATEMENTS {
                conn.prepare_cached(sql)?;
            }
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(max_connections.max(1))
            .min_idle(Some(1))
            .max_lifetime(Some(MAX_CONNECTION_LIFETIME))
            .idle_timeout(Some(MAX_CONNECTION_IDLE))
            .build(manager)?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            pool,
        })
    }

    /// Location of the database file
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> crate::Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Insert a row for a new composition, returning its row id
    pub fn insert(&self, record: &Composition) -> crate::Result<i64> {
        debug!(
            file_path = %record.file_path.display(),
            character_count = record.character_count,
            line_count = record.line_count,
            "Inserting composition"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(INSERT_SQL)?;
        stmt.execute(params![
            path_key(&record.file_path),
            format_timestamp(record.created_at)?,
            record.working_directory,
            record.content,
            record.character_count as i64,
            record.line_count as i64,
            format_timestamp(record.updated_at)?,
        ])?;
        Ok(conn.last_insert_rowid())
    }

    /// Replace content and metrics of an existing row.
    ///
    /// Zero affected rows is reported as `NotFound`: the file exists but the
    /// index lost track of it.
    pub fn update(&self, path: &Path, update: &ContentUpdate) -> crate::Result<usize> {
        debug!(
            file_path = %path.display(),
            character_count = update.character_count,
            line_count = update.line_count,
            "Updating composition"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(UPDATE_SQL)?;
        let rows = stmt.execute(params![
            update.content,
            update.character_count as i64,
            update.line_count as i64,
            format_timestamp(update.updated_at)?,
            path_key(path),
        ])?;

        if rows == 0 {
            return Err(QuireError::NotFound(path.to_path_buf()));
        }
        Ok(rows)
    }

    pub fn get_by_path(&self, path: &Path) -> crate::Result<Option<Composition>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(SELECT_BY_PATH_SQL)?;
        let record = stmt
            .query_row(params![path_key(path)], composition_from_row)
            .optional()?;
        Ok(record)
    }

    /// Every row, newest first
    pub fn get_all(&self) -> crate::Result<Vec<Composition>> {
        self.query_compositions(SELECT_ALL_SQL, [])
    }

    pub fn get_by_directory(&self, working_dir: &str) -> crate::Result<Vec<Composition>> {
        self.query_compositions(SELECT_BY_DIRECTORY_SQL, params![working_dir])
    }

    /// Rows created within `[start, end]`, newest first
    pub fn get_by_date_range(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> crate::Result<Vec<Composition>> {
        let mut records = self.get_all()?;
        records.retain(|c| c.created_at >= start && c.created_at <= end);
        Ok(records)
    }

    /// Remove a row; zero affected rows is reported as `NotFound`
    pub fn delete(&self, path: &Path) -> crate::Result<usize> {
        debug!(file_path = %path.display(), "Deleting composition");

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(DELETE_SQL)?;
        let rows = stmt.execute(params![path_key(path)])?;

        if rows == 0 {
            return Err(QuireError::NotFound(path.to_path_buf()));
        }
        Ok(rows)
    }

    pub fn exists(&self, path: &Path) -> crate::Result<bool> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(EXISTS_SQL)?;
        let count: i64 = stmt.query_row(params![path_key(path)], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Run an FTS5 MATCH expression. Callers are expected to sanitize it.
    pub fn search(&self, fts_query: &str) -> crate::Result<Vec<Composition>> {
        debug!(query = fts_query, "Searching compositions");
        self.query_compositions(SEARCH_SQL, params![fts_query])
    }

    pub fn count(&self) -> crate::Result<usize> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(COUNT_SQL)?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Regenerate the full-text table from the `compositions` rows
    pub fn rebuild_fts(&self) -> crate::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO compositions_fts(compositions_fts) VALUES ('rebuild')",
            [],
        )?;
        Ok(())
    }

    /// Fold the write-ahead log into the main database file
    pub fn checkpoint(&self) -> crate::Result<()> {
        let conn = self.conn()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    fn query_compositions<P: Params>(&self, sql: &str, params: P) -> crate::Result<Vec<Composition>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let records = stmt
            .query_map(params, composition_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(newest_first(records))
    }
}

/// Order rows by parsed creation time, newest first, ties by descending id.
///
/// Rows written by older tools may carry local offsets, so the text in
/// `created_at` does not sort chronologically.
fn newest_first(mut records: Vec<Composition>) -> Vec<Composition> {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    records
}

/// Index key for a composition path
fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Construct a Composition from the standard 8-column row:
/// (id, file_path, created_at, working_directory, content, character_count, line_count, updated_at)
fn composition_from_row(row: &Row) -> rusqlite::Result<Composition> {
    let file_path: String = row.get(1)?;
    let character_count: i64 = row.get(5)?;
    let line_count: i64 = row.get(6)?;

    Ok(Composition {
        id: row.get(0)?,
        file_path: PathBuf::from(file_path),
        created_at: timestamp_column(row, 2)?,
        working_directory: row.get(3)?,
        content: row.get(4)?,
        character_count: character_count.max(0) as u64,
        line_count: line_count.max(0) as u64,
        updated_at: timestamp_column(row, 7)?,
    })
}

fn timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
