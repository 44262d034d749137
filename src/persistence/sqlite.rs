use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::traits::SnapshotStore;

/// Snapshot store backed by one row per key in a SQLite table.
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
    key: String,
}

impl SqliteSnapshotStore {
    pub fn open(path: &Path, key: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open snapshot database {}", path.display()))?;
        Self::with_connection(conn, key)
    }

    pub fn open_in_memory(key: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, key)
    }

    fn with_connection(conn: Connection, key: &str) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS session_snapshots (
                 key        TEXT PRIMARY KEY,
                 payload    TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .context("failed to initialize snapshot schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            key: key.to_string(),
        })
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn load(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT payload FROM session_snapshots WHERE key = ?1",
            params![self.key],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read session snapshot")
    }

    fn save(&self, payload: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO session_snapshots (key, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            params![self.key, payload, Utc::now().to_rfc3339()],
        )
        .context("failed to write session snapshot")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM session_snapshots WHERE key = ?1",
            params![self.key],
        )
        .context("failed to clear session snapshot")?;
        Ok(())
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_overwrites_previous_payload() {
        let store = SqliteSnapshotStore::open_in_memory("ns:tab").unwrap();
        assert_eq!(store.load().unwrap(), None);

        store.save("[1]").unwrap();
        store.save("[2]").unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("[2]"));

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn keys_are_isolated_and_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state").join("sessions.db");

        {
            let tab_a = SqliteSnapshotStore::open(&path, "ns:a").unwrap();
            let tab_b = SqliteSnapshotStore::open(&path, "ns:b").unwrap();
            tab_a.save("[\"a\"]").unwrap();
            tab_b.save("[\"b\"]").unwrap();
        }

        let reopened = SqliteSnapshotStore::open(&path, "ns:a").unwrap();
        assert_eq!(reopened.load().unwrap().as_deref(), Some("[\"a\"]"));
        assert_eq!(reopened.key(), "ns:a");
    }
}
