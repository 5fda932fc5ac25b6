//! SQLite-backed cache storage.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{CacheEntry, CacheStorage};
use crate::error::{PrecacheError, PrecacheResult};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Buckets persisted in a single SQLite database file.
pub struct SqliteCacheStorage {
    conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> PrecacheResult<Self> {
        let conn = Connection::open(path).map_err(|e| {
            PrecacheError::storage(format!("Failed to open cache database: {}", e))
        })?;
        info!(path = %path.display(), "Opened cache database");
        Self::with_connection(conn)
    }

    /// Database that lives only as long as this value.
    pub fn open_in_memory() -> PrecacheResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> PrecacheResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn init_schema(conn: &Connection) -> PrecacheResult<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )
        .unwrap_or(false);

    let version: i32 = if table_exists {
        conn.query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0)
    } else {
        0
    };

    if version < 1 {
        create_schema_v1(conn)?;
    } else if version > SCHEMA_VERSION {
        return Err(PrecacheError::storage(format!(
            "cache database schema {} is newer than supported {}",
            version, SCHEMA_VERSION
        )));
    }

    Ok(())
}

fn create_schema_v1(conn: &Connection) -> PrecacheResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS caches (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_entries (
            cache_name TEXT NOT NULL REFERENCES caches(name) ON DELETE CASCADE,
            url TEXT NOT NULL,
            method TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (cache_name, url)
        );
        "#,
    )
    .map_err(|e| PrecacheError::storage(format!("Failed to create schema: {}", e)))?;

    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![SCHEMA_VERSION, Utc::now().timestamp()],
    )?;

    Ok(())
}

fn ensure_cache(conn: &Connection, cache: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?, ?)",
        params![cache, Utc::now().timestamp()],
    )?;
    Ok(())
}

#[async_trait]
impl CacheStorage for SqliteCacheStorage {
    async fn open(&self, cache: &str) -> PrecacheResult<()> {
        let conn = self.conn.lock().await;
        ensure_cache(&conn, cache)?;
        Ok(())
    }

    async fn has(&self, cache: &str) -> PrecacheResult<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM caches WHERE name = ?",
            params![cache],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn delete(&self, cache: &str) -> PrecacheResult<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM caches WHERE name = ?", params![cache])?;
        Ok(removed > 0)
    }

    async fn cache_names(&self) -> PrecacheResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY created_at, name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    async fn keys(&self, cache: &str) -> PrecacheResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT url FROM cache_entries WHERE cache_name = ?")?;
        let keys = stmt
            .query_map(params![cache], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    async fn match_request(&self, cache: &str, url: &str) -> PrecacheResult<Option<CacheEntry>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT method, status, headers, body, cached_at FROM cache_entries
                 WHERE cache_name = ? AND url = ?",
                params![cache, url],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u16>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((method, status, headers, body, cached_at)) = row else {
            return Ok(None);
        };

        Ok(Some(CacheEntry {
            url: url.to_string(),
            method,
            status,
            headers: serde_json::from_str(&headers)?,
            body,
            cached_at,
        }))
    }

    async fn put_all(&self, cache: &str, entries: Vec<CacheEntry>) -> PrecacheResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        ensure_cache(&tx, cache)?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO cache_entries
                 (cache_name, url, method, status, headers, body, cached_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for entry in &entries {
                stmt.execute(params![
                    cache,
                    entry.url,
                    entry.method,
                    entry.status,
                    serde_json::to_string(&entry.headers)?,
                    entry.body,
                    entry.cached_at,
                ])?;
            }
        }
        tx.commit()?;
        debug!(cache, count = entries.len(), "Committed cache entries");
        Ok(())
    }

    async fn delete_entry(&self, cache: &str, url: &str) -> PrecacheResult<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE cache_name = ? AND url = ?",
            params![cache, url],
        )?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    fn entry(url: &str, body: &[u8]) -> CacheEntry {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/css".to_string());
        CacheEntry {
            url: url.to_string(),
            method: "GET".to_string(),
            status: 200,
            headers,
            body: body.to_vec(),
            cached_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let storage = SqliteCacheStorage::open_in_memory().unwrap();
        storage
            .put_all("v1", vec![entry("https://a/x.css", b"body{}")])
            .await
            .unwrap();

        let found = storage.match_request("v1", "https://a/x.css").await.unwrap().unwrap();
        assert_eq!(found, entry("https://a/x.css", b"body{}"));
        assert!(storage.match_request("v1", "https://a/y.css").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_bucket_cascades() {
        let storage = SqliteCacheStorage::open_in_memory().unwrap();
        storage
            .put_all("v1", vec![entry("https://a/x.css", b"1")])
            .await
            .unwrap();

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await.unwrap());
        assert!(storage.keys("v1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.sqlite");

        {
            let storage = SqliteCacheStorage::open(&path).unwrap();
            storage
                .put_all("v1", vec![entry("https://a/x.css", b"1"), entry("https://a/y.css", b"2")])
                .await
                .unwrap();
            assert!(storage.delete_entry("v1", "https://a/y.css").await.unwrap());
        }

        let storage = SqliteCacheStorage::open(&path).unwrap();
        assert_eq!(storage.cache_names().await.unwrap(), vec!["v1".to_string()]);
        assert_eq!(storage.keys("v1").await.unwrap(), vec!["https://a/x.css".to_string()]);
    }
}
