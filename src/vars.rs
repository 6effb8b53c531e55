//! §4.6/ambient config: hub-scoped and global settings, backed by the
//! `vars` table. Mirrors the reference client's `conf_*` accessor layer,
//! generalised to a small trait so tests can swap in an in-memory store.

use crate::error::{CoreError, CoreResult};
use rusqlite::{params, Connection, OptionalExtension};

/// Global scope, as opposed to a specific hub's override.
pub const GLOBAL: &str = "";

pub trait VarStore {
    fn get(&self, name: &str, hub: &str) -> CoreResult<Option<String>>;
    fn set(&self, name: &str, hub: &str, value: &str) -> CoreResult<()>;
    fn unset(&self, name: &str, hub: &str) -> CoreResult<()>;

    /// Look up a hub-scoped value, falling back to the global default.
    fn get_effective(&self, name: &str, hub: &str) -> CoreResult<Option<String>> {
        if hub != GLOBAL {
            if let Some(v) = self.get(name, hub)? {
                return Ok(Some(v));
            }
        }
        self.get(name, GLOBAL)
    }
}

pub struct SqliteVarStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteVarStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl<'a> VarStore for SqliteVarStore<'a> {
    fn get(&self, name: &str, hub: &str) -> CoreResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM vars WHERE name = ?1 AND hub = ?2",
                params![name, hub],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    fn set(&self, name: &str, hub: &str, value: &str) -> CoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO vars (name, hub, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name, hub) DO UPDATE SET value = excluded.value",
                params![name, hub, value],
            )
            .map_err(|e| CoreError::Config(e.to_string()))?;
        Ok(())
    }

    fn unset(&self, name: &str, hub: &str) -> CoreResult<()> {
        self.conn
            .execute("DELETE FROM vars WHERE name = ?1 AND hub = ?2", params![name, hub])
            .map_err(|e| CoreError::Config(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;

    #[test]
    fn hub_scoped_value_overrides_global() {
        let conn = store::open_in_memory().unwrap();
        let store = SqliteVarStore::new(&conn);
        store.set("slots", GLOBAL, "10").unwrap();
        store.set("slots", "hub1", "3").unwrap();
        assert_eq!(store.get_effective("slots", "hub1").unwrap().as_deref(), Some("3"));
        assert_eq!(store.get_effective("slots", "hub2").unwrap().as_deref(), Some("10"));
    }

    #[test]
    fn unset_removes_the_override() {
        let conn = store::open_in_memory().unwrap();
        let store = SqliteVarStore::new(&conn);
        store.set("nick", "hub1", "bob").unwrap();
        store.unset("nick", "hub1").unwrap();
        assert_eq!(store.get("nick", "hub1").unwrap(), None);
    }
}
