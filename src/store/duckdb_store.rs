use super::{RecordStore, StoredRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{params, Connection, OptionalExt};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// DuckDB-backed record store.
///
/// Records live in `sync_records`; tags are normalised into
/// `sync_record_tags` so tag invalidation is a single indexed lookup.
pub struct DuckDbRecordStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl DuckDbRecordStore {
    /// Open (creating if needed) a database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create store directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB store at {}", path.display()))?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Open a transient in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory DuckDB")?;
        Self::init(conn, None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_records (
                key TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sync_record_tags (
                key TEXT NOT NULL,
                tag TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sync_record_tags_tag ON sync_record_tags(tag);",
        )
        .context("Failed to initialise sync store schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecordStore for DuckDbRecordStore {
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        let conn = self.conn();

        let row = conn
            .query_row(
                "SELECT data, updated_at FROM sync_records WHERE key = ?",
                params![key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .with_context(|| format!("Failed to read record '{}'", key))?;

        let Some((data, updated_at)) = row else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare("SELECT tag FROM sync_record_tags WHERE key = ?")
            .context("Failed to prepare tag lookup")?;
        let tags = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<BTreeSet<String>, _>>()
            .with_context(|| format!("Failed to read tags for '{}'", key))?;

        let data = serde_json::from_str(&data)
            .with_context(|| format!("Corrupt JSON stored under '{}'", key))?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .with_context(|| format!("Corrupt timestamp stored under '{}'", key))?
            .with_timezone(&Utc);

        Ok(Some(StoredRecord {
            data,
            updated_at,
            tags,
        }))
    }

    async fn put(&self, key: &str, record: StoredRecord) -> Result<()> {
        let data = serde_json::to_string(&record.data)?;
        let updated_at = record.updated_at.to_rfc3339();

        let mut conn = self.conn();
        let tx = conn.transaction().context("Failed to begin transaction")?;
        tx.execute(
            "INSERT OR REPLACE INTO sync_records (key, data, updated_at) VALUES (?, ?, ?)",
            params![key, data, updated_at],
        )
        .with_context(|| format!("Failed to write record '{}'", key))?;
        tx.execute("DELETE FROM sync_record_tags WHERE key = ?", params![key])?;
        for tag in &record.tags {
            tx.execute(
                "INSERT INTO sync_record_tags (key, tag) VALUES (?, ?)",
                params![key, tag],
            )?;
        }
        tx.commit()
            .with_context(|| format!("Failed to commit record '{}'", key))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let removed = tx
            .execute("DELETE FROM sync_records WHERE key = ?", params![key])
            .with_context(|| format!("Failed to remove record '{}'", key))?;
        tx.execute("DELETE FROM sync_record_tags WHERE key = ?", params![key])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    async fn keys_with_tag(&self, tag: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT DISTINCT key FROM sync_record_tags WHERE tag = ? ORDER BY key")
            .context("Failed to prepare tag query")?;
        let keys = stmt
            .query_map(params![tag], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<String>, _>>()
            .with_context(|| format!("Failed to list keys tagged '{}'", tag))?;
        Ok(keys)
    }
}
