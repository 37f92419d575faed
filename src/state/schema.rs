//! Checkpoint schema, versioned through `PRAGMA user_version`.

use rusqlite::Connection;

use super::error::StateError;

/// Step `i` upgrades a database at version `i` to `i + 1`.
const MIGRATIONS: &[&str] = &[
    // 1: asset records and per-album scan offsets
    r#"
    CREATE TABLE assets (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        data TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at INTEGER NOT NULL
    );
    CREATE INDEX idx_assets_status ON assets(status);
    CREATE TABLE offsets (
        album TEXT PRIMARY KEY NOT NULL,
        scan_offset INTEGER NOT NULL,
        saved_at INTEGER NOT NULL
    );
    "#,
];

pub const SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

pub(crate) fn user_version(conn: &Connection) -> Result<i32, StateError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring the schema up to [`SCHEMA_VERSION`]. Each step commits together
/// with its version bump, so an interrupted upgrade resumes where it stopped.
pub(crate) fn migrate(conn: &mut Connection) -> Result<(), StateError> {
    let found = user_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(StateError::UnsupportedSchemaVersion {
            found,
            expected: SCHEMA_VERSION,
        });
    }

    for (from, sql) in MIGRATIONS.iter().enumerate().skip(found.max(0) as usize) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", from as i32 + 1)?;
        tx.commit()?;
        tracing::debug!(from, to = from + 1, "Applied checkpoint schema migration");
    }
    Ok(())
}
