//! Table definitions for the six tables the core persists across restarts.

use rusqlite::Connection;

pub fn ensure(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS vars (
            name  TEXT NOT NULL,
            hub   TEXT NOT NULL DEFAULT '',
            value TEXT NOT NULL,
            PRIMARY KEY (name, hub)
        );

        CREATE TABLE IF NOT EXISTS hashdata (
            tth       BLOB PRIMARY KEY,
            size      INTEGER NOT NULL,
            leaf_size INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS hashfiles (
            id       INTEGER PRIMARY KEY AUTOINCREMENT,
            tth      BLOB NOT NULL REFERENCES hashdata(tth) ON DELETE CASCADE,
            filename TEXT NOT NULL,
            mtime    INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS hashfiles_tth ON hashfiles(tth);

        CREATE TABLE IF NOT EXISTS share (
            virtual_path TEXT PRIMARY KEY,
            local_path   TEXT NOT NULL,
            tth          BLOB REFERENCES hashdata(tth),
            size         INTEGER NOT NULL,
            is_dir       INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS dl (
            tth         BLOB PRIMARY KEY,
            size        INTEGER NOT NULL,
            dest        TEXT NOT NULL,
            priority    INTEGER NOT NULL DEFAULT 0,
            error       INTEGER,
            error_msg   TEXT
        );

        CREATE TABLE IF NOT EXISTS dl_users (
            tth   BLOB NOT NULL REFERENCES dl(tth) ON DELETE CASCADE,
            hub   TEXT NOT NULL,
            nick  TEXT NOT NULL,
            error INTEGER,
            PRIMARY KEY (tth, hub, nick)
        );
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        ensure(&conn).unwrap();
        ensure(&conn).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(count >= 6);
    }
}
