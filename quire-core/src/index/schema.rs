//! Index schema creation and upgrade

use crate::timestamp::{format_timestamp, parse_timestamp};
use rusqlite::{params, Connection};
use tracing::{info, warn};

/// Revision stored in `PRAGMA user_version` once the FTS triggers exist.
pub(crate) const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS compositions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_path TEXT NOT NULL UNIQUE,
        created_at TIMESTAMP NOT NULL,
        working_directory TEXT NOT NULL,
        content TEXT NOT NULL,
        character_count INTEGER NOT NULL,
        line_count INTEGER NOT NULL,
        updated_at TIMESTAMP NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_created_at ON compositions(created_at);
    CREATE INDEX IF NOT EXISTS idx_working_directory ON compositions(working_directory);

    -- External-content FTS5 table; rows come from compositions via the triggers below
    CREATE VIRTUAL TABLE IF NOT EXISTS compositions_fts USING fts5(
        content,
        working_directory,
        content='compositions',
        content_rowid='id'
    );

    CREATE TRIGGER IF NOT EXISTS compositions_fts_insert
    AFTER INSERT ON compositions BEGIN
        INSERT INTO compositions_fts(rowid, content, working_directory)
        VALUES (new.id, new.content, new.working_directory);
    END;

    CREATE TRIGGER IF NOT EXISTS compositions_fts_delete
    AFTER DELETE ON compositions BEGIN
        INSERT INTO compositions_fts(compositions_fts, rowid, content, working_directory)
        VALUES ('delete', old.id, old.content, old.working_directory);
    END;

    CREATE TRIGGER IF NOT EXISTS compositions_fts_update
    AFTER UPDATE ON compositions BEGIN
        INSERT INTO compositions_fts(compositions_fts, rowid, content, working_directory)
        VALUES ('delete', old.id, old.content, old.working_directory);
        INSERT INTO compositions_fts(rowid, content, working_directory)
        VALUES (new.id, new.content, new.working_directory);
    END;
";

/// Create the schema on a fresh database, or bring an older one up to date.
///
/// Databases written before the triggers existed may hold an FTS table that
/// never saw their rows, so the upgrade rebuilds it from `compositions`.
/// Their timestamps may also carry local offsets; those are rewritten in the
/// fixed UTC form so the text sorts chronologically.
pub(crate) fn init_schema(conn: &Connection) -> crate::Result<()> {
    // WAL so readers are not blocked by the auto-save writer
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA busy_timeout = 5000;
        PRAGMA synchronous = NORMAL;
        ",
    )?;

    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    let legacy: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'compositions'",
        [],
        |row| row.get(0),
    )?;

    if legacy {
        normalize_timestamps(conn)?;
    }

    conn.execute_batch(SCHEMA)?;

    if legacy {
        info!("Upgrading legacy history index, rebuilding full-text table");
        conn.execute(
            "INSERT INTO compositions_fts(compositions_fts) VALUES ('rebuild')",
            [],
        )?;
    }

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Rewrite every parseable timestamp in the fixed UTC column format.
///
/// Runs before the FTS triggers exist, so no update reaches the FTS table.
fn normalize_timestamps(conn: &Connection) -> crate::Result<()> {
    let mut stmt = conn.prepare("SELECT id, created_at, updated_at FROM compositions")?;
    let rows: Vec<(i64, String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let tx = conn.unchecked_transaction()?;
    let mut rewritten = 0;
    for (id, created_at, updated_at) in rows {
        let (created, updated) = match (parse_timestamp(&created_at), parse_timestamp(&updated_at)) {
            (Ok(created), Ok(updated)) => (format_timestamp(created)?, format_timestamp(updated)?),
            (Err(e), _) | (_, Err(e)) => {
                warn!(id, error = %e, "Leaving unparseable legacy timestamp as is");
                continue;
            }
        };
        if created != created_at || updated != updated_at {
            tx.execute(
                "UPDATE compositions SET created_at = ?1, updated_at = ?2 WHERE id = ?3",
                params![created, updated, id],
            )?;
            rewritten += 1;
        }
    }
    tx.commit()?;

    if rewritten > 0 {
        info!(rows = rewritten, "Normalized legacy timestamps");
    }
    Ok(())
}
