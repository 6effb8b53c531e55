//! Persistence for the download queue: the `dl`/`dl_users` tables.

use crate::error::{CoreError, CoreResult, IntegrityKind};
use crate::tth::Tth;
use rusqlite::{params, Connection, OptionalExtension};

pub struct QueueStore<'a> {
    conn: &'a Connection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlItemRow {
    pub tth: Tth,
    pub size: u64,
    pub dest: String,
    pub priority: i32,
    pub error: Option<IntegrityKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlUserRow {
    pub hub: String,
    pub nick: String,
    pub error: Option<IntegrityKind>,
}

impl<'a> QueueStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert_item(&self, tth: &Tth, size: u64, dest: &str, priority: i32) -> CoreResult<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO dl (tth, size, dest, priority) VALUES (?1, ?2, ?3, ?4)",
                params![tth.as_slice(), size as i64, dest, priority],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn remove_item(&self, tth: &Tth) -> CoreResult<()> {
        self.conn
            .execute("DELETE FROM dl WHERE tth = ?1", params![tth.as_slice()])
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_priority(&self, tth: &Tth, priority: i32) -> CoreResult<()> {
        self.conn
            .execute("UPDATE dl SET priority = ?2 WHERE tth = ?1", params![tth.as_slice(), priority])
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_item_error(&self, tth: &Tth, error: Option<&IntegrityKind>) -> CoreResult<()> {
        self.conn
            .execute(
                "UPDATE dl SET error = ?2, error_msg = ?3 WHERE tth = ?1",
                params![tth.as_slice(), error.map(IntegrityKind::code), error.map(|e| e.to_string())],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn add_user(&self, tth: &Tth, hub: &str, nick: &str) -> CoreResult<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO dl_users (tth, hub, nick) VALUES (?1, ?2, ?3)",
                params![tth.as_slice(), hub, nick],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn remove_user(&self, hub: &str, nick: &str) -> CoreResult<()> {
        self.conn
            .execute("DELETE FROM dl_users WHERE hub = ?1 AND nick = ?2", params![hub, nick])
            .map_err(db_err)?;
        Ok(())
    }

    pub fn set_user_error(&self, tth: &Tth, hub: &str, nick: &str, error: Option<&IntegrityKind>) -> CoreResult<()> {
        self.conn
            .execute(
                "UPDATE dl_users SET error = ?4 WHERE tth = ?1 AND hub = ?2 AND nick = ?3",
                params![tth.as_slice(), hub, nick, error.map(IntegrityKind::code)],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_item(&self, tth: &Tth) -> CoreResult<Option<DlItemRow>> {
        self.conn
            .query_row(
                "SELECT tth, size, dest, priority, error FROM dl WHERE tth = ?1",
                params![tth.as_slice()],
                row_to_item,
            )
            .optional()
            .map_err(db_err)
    }

    pub fn list_items(&self) -> CoreResult<Vec<DlItemRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT tth, size, dest, priority, error FROM dl ORDER BY priority DESC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], row_to_item)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn list_users(&self, tth: &Tth) -> CoreResult<Vec<DlUserRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT hub, nick, error FROM dl_users WHERE tth = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![tth.as_slice()], |row| {
                Ok(DlUserRow {
                    hub: row.get(0)?,
                    nick: row.get(1)?,
                    error: row.get::<_, Option<i64>>(2)?.map(code_to_kind),
                })
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }
}

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<DlItemRow> {
    let tth_blob: Vec<u8> = row.get(0)?;
    let mut tth = [0u8; 24];
    tth.copy_from_slice(&tth_blob);
    Ok(DlItemRow {
        tth,
        size: row.get::<_, i64>(1)? as u64,
        dest: row.get(2)?,
        priority: row.get(3)?,
        error: row.get::<_, Option<i64>>(4)?.map(code_to_kind),
    })
}

fn code_to_kind(code: i64) -> IntegrityKind {
    match code {
        1 => IntegrityKind::InvTthl,
        2 => IntegrityKind::NoFile,
        3 => IntegrityKind::IoInc(0),
        4 => IntegrityKind::IoDest(0),
        _ => IntegrityKind::Hash(0),
    }
}

fn db_err(e: rusqlite::Error) -> CoreError {
    CoreError::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;

    #[test]
    fn insert_and_list_round_trips() {
        let conn = store::open_in_memory().unwrap();
        let store = QueueStore::new(&conn);
        let tth = [3u8; 24];
        store.insert_item(&tth, 1000, "/tmp/out.bin", 5).unwrap();
        let items = store.list_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].dest, "/tmp/out.bin");
        assert_eq!(items[0].priority, 5);
    }

    #[test]
    fn add_and_remove_users() {
        let conn = store::open_in_memory().unwrap();
        let store = QueueStore::new(&conn);
        let tth = [4u8; 24];
        store.insert_item(&tth, 1, "/tmp/a", 0).unwrap();
        store.add_user(&tth, "hub1", "bob").unwrap();
        assert_eq!(store.list_users(&tth).unwrap().len(), 1);
        store.remove_user("hub1", "bob").unwrap();
        assert!(store.list_users(&tth).unwrap().is_empty());
    }
}
