//! Dictation history
//!
//! SQLite-backed store for finished dictations. Only consulted when
//! history saving is enabled; the store prunes itself down to the
//! configured number of newest entries after every insert.

use crate::error::HistoryError;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// One finished dictation
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    /// Session length, start of recording to final text
    pub duration_ms: u64,
    /// Backend label that produced the text, e.g. "whisper/base"
    pub engine: String,
}

impl HistoryEntry {
    /// `id` and `timestamp` come from the session that produced the
    /// text, so history lines up with session logs and events
    pub fn new(
        id: Uuid,
        timestamp: DateTime<Utc>,
        text: String,
        duration_ms: u64,
        engine: String,
    ) -> Self {
        Self {
            id,
            timestamp,
            text,
            duration_ms,
            engine,
        }
    }
}

/// Store for finished dictations
pub trait HistoryStore: Send + Sync {
    fn add(&self, entry: &HistoryEntry) -> Result<(), HistoryError>;

    /// Newest entries first
    fn recent(&self, limit: u32) -> Result<Vec<HistoryEntry>, HistoryError>;
}

/// SQLite-backed history store
pub struct SqliteHistory {
    conn: Mutex<Connection>,
    /// Keep only the newest N entries (0 = unlimited)
    max_entries: u32,
}

impl SqliteHistory {
    /// Open or create the history database
    pub fn open(path: &Path, max_entries: u32) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            max_entries,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), HistoryError> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                text TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                engine TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON entries(timestamp DESC);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means a panic mid-statement; the connection
        // itself is still usable
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn prune(&self, conn: &Connection) -> Result<(), HistoryError> {
        if self.max_entries == 0 {
            return Ok(());
        }

        let removed = conn.execute(
            r#"
            DELETE FROM entries WHERE id NOT IN (
                SELECT id FROM entries ORDER BY timestamp DESC, id LIMIT ?1
            )
            "#,
            params![self.max_entries],
        )?;

        if removed > 0 {
            tracing::debug!("Pruned {} old history entries", removed);
        }
        Ok(())
    }
}

impl HistoryStore for SqliteHistory {
    fn add(&self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO entries (id, timestamp, text, duration_ms, engine)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                entry.id.to_string(),
                entry.timestamp.timestamp_millis(),
                entry.text,
                entry.duration_ms as i64,
                entry.engine,
            ],
        )?;
        self.prune(&conn)
    }

    fn recent(&self, limit: u32) -> Result<Vec<HistoryEntry>, HistoryError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, timestamp, text, duration_ms, engine
            FROM entries ORDER BY timestamp DESC, id LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![limit], |row| {
            let id: String = row.get(0)?;
            let millis: i64 = row.get(1)?;
            Ok(HistoryEntry {
                id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
                timestamp: Utc
                    .timestamp_millis_opt(millis)
                    .single()
                    .unwrap_or_else(Utc::now),
                text: row.get(2)?,
                duration_ms: row.get::<_, i64>(3)? as u64,
                engine: row.get(4)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(max_entries: u32) -> (tempfile::TempDir, SqliteHistory) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteHistory::open(&dir.path().join("history.db"), max_entries).unwrap();
        (dir, store)
    }

    #[test]
    fn test_add_and_recent_roundtrip() {
        let (_dir, store) = open_store(100);

        let entry = HistoryEntry::new(
            Uuid::new_v4(),
            Utc::now(),
            "hello world".to_string(),
            3200,
            "whisper/base".to_string(),
        );
        store.add(&entry).unwrap();

        let entries = store.recent(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, entry.id);
        assert_eq!(entries[0].text, "hello world");
        assert_eq!(entries[0].duration_ms, 3200);
        assert_eq!(entries[0].engine, "whisper/base");
    }

    #[test]
    fn test_recent_is_newest_first() {
        let (_dir, store) = open_store(100);

        for i in 0..3 {
            let entry = HistoryEntry::new(
                Uuid::new_v4(),
                Utc.timestamp_millis_opt(1_000 * (i + 1)).single().unwrap(),
                format!("entry {}", i),
                1000,
                "parakeet".to_string(),
            );
            store.add(&entry).unwrap();
        }

        let entries = store.recent(10).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].text, "entry 2");
        assert_eq!(entries[2].text, "entry 0");
    }

    #[test]
    fn test_prune_keeps_newest() {
        let (_dir, store) = open_store(2);

        for i in 0..5 {
            let entry = HistoryEntry::new(
                Uuid::new_v4(),
                Utc.timestamp_millis_opt(1_000 * (i + 1)).single().unwrap(),
                format!("entry {}", i),
                500,
                "test".to_string(),
            );
            store.add(&entry).unwrap();
        }

        let entries = store.recent(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "entry 4");
        assert_eq!(entries[1].text, "entry 3");
    }

    #[test]
    fn test_zero_max_entries_is_unlimited() {
        let (_dir, store) = open_store(0);

        for i in 0..10 {
            store
                .add(&HistoryEntry::new(
                    Uuid::new_v4(),
                    Utc::now(),
                    format!("entry {}", i),
                    500,
                    "test".to_string(),
                ))
                .unwrap();
        }

        assert_eq!(store.recent(100).unwrap().len(), 10);
    }
}
