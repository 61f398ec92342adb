//! Single-file durable backing for the documentation cache.
//!
//! Entries live in one SQLite table keyed by the normalized cache key. The
//! file is opened once per process; it is not safe to share between servers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

use crate::cache::CacheEntry;
use crate::docs_parser::DocumentationRecord;
use crate::key::CacheKey;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS doc_cache (
    key         TEXT PRIMARY KEY,
    package     TEXT NOT NULL,
    version     TEXT NOT NULL,
    item_path   TEXT NOT NULL,
    record      TEXT NOT NULL,
    inserted_at INTEGER NOT NULL,
    expires_at  INTEGER NOT NULL,
    size_hint   INTEGER NOT NULL
);";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Storage connection lock poisoned")]
    Poisoned,
}

/// Persisted form of a cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub key: CacheKey,
    pub record: DocumentationRecord,
    pub inserted_at: u64,
    pub expires_at: u64,
    pub size_hint: usize,
}

/// Result of loading every persisted row.
#[derive(Debug, Default)]
pub struct LoadedEntries {
    pub entries: Vec<StoredEntry>,
    /// Keys of rows that could not be decoded; they have been deleted.
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DurableStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl DurableStore {
    /// Opens (or creates) the store and verifies that the file is a readable
    /// database.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let path = path.to_path_buf();
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StorageError> {
            if let Some(parent) = open_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&open_path)?;
            conn.busy_timeout(Duration::from_secs(5))?;
            let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
            if check != "ok" {
                return Err(StorageError::Integrity(check));
            }
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await??;

        tracing::info!("Opened durable documentation cache at {:?}", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StorageError::Poisoned)?;
            f(&guard)
        })
        .await?
    }

    /// Loads every row, oldest insertion first. Undecodable rows are removed.
    pub async fn load_all(&self) -> Result<LoadedEntries, StorageError> {
        self.with_conn(|conn| {
            let mut loaded = LoadedEntries::default();
            {
                let mut stmt = conn.prepare(
                    "SELECT key, package, version, item_path, record, inserted_at, expires_at, size_hint
                     FROM doc_cache ORDER BY inserted_at ASC",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    let raw_key: String = row.get(0)?;
                    match decode_row(row) {
                        Ok(entry) => loaded.entries.push(entry),
                        Err(e) => {
                            tracing::warn!("Dropping unreadable cache row '{}': {}", raw_key, e);
                            loaded.dropped.push(raw_key);
                        }
                    }
                }
            }
            for key in &loaded.dropped {
                conn.execute("DELETE FROM doc_cache WHERE key = ?1", params![key])?;
            }
            Ok(loaded)
        })
        .await
    }

    pub async fn read(&self, key: &CacheKey) -> Result<Option<StoredEntry>, StorageError> {
        let storage_key = key.storage_key();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT key, package, version, item_path, record, inserted_at, expires_at, size_hint
                     FROM doc_cache WHERE key = ?1",
                    params![storage_key],
                    |row| Ok(decode_row(row)),
                )
                .optional()?;
            row.transpose()
        })
        .await
    }

    /// Inserts or overwrites the row for the entry's key.
    pub async fn write(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        let record = serde_json::to_string(entry.value.as_ref())?;
        let key = entry.key.clone();
        let (inserted_at, expires_at, size_hint) =
            (entry.inserted_at, entry.expires_at, entry.size_hint);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO doc_cache
                 (key, package, version, item_path, record, inserted_at, expires_at, size_hint)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    key.storage_key(),
                    key.package(),
                    key.version(),
                    key.item_path(),
                    record,
                    inserted_at as i64,
                    expires_at as i64,
                    size_hint as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, keys: Vec<CacheKey>) -> Result<usize, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("DELETE FROM doc_cache WHERE key = ?1")?;
            let mut removed = 0;
            for key in keys {
                removed += stmt.execute(params![key.storage_key()])?;
            }
            Ok(removed)
        })
        .await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM doc_cache", [])?;
            Ok(())
        })
        .await
    }
}

fn decode_row(row: &Row<'_>) -> Result<StoredEntry, StorageError> {
    let package: String = row.get(1)?;
    let version: String = row.get(2)?;
    let item_path: String = row.get(3)?;
    let record: String = row.get(4)?;
    let inserted_at: i64 = row.get(5)?;
    let expires_at: i64 = row.get(6)?;
    let size_hint: i64 = row.get(7)?;

    let key = CacheKey::new(&package, Some(&version), Some(&item_path))
        .map_err(|e| StorageError::Integrity(e.to_string()))?;
    Ok(StoredEntry {
        key,
        record: serde_json::from_str(&record)?,
        inserted_at: inserted_at.max(0) as u64,
        expires_at: expires_at.max(0) as u64,
        size_hint: size_hint.max(0) as usize,
    })
}
