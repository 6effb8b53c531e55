//! §4.6 Persistence: a single `rusqlite` connection backing the share
//! index, the download queue and the variable store.

pub mod schema;

use rusqlite::Connection;
use std::path::Path;

/// Open (creating if needed) the database at `path` and ensure the schema
/// is up to date.
pub fn open(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", true)?;
    schema::ensure(&conn)?;
    Ok(conn)
}

/// In-memory database, for tests and scratch sessions.
pub fn open_in_memory() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    schema::ensure(&conn)?;
    Ok(conn)
}
