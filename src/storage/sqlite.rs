use super::{duration_millis, escape_glob_classes, remaining_secs, unix_millis_now, KeyTtl, Storage};
use crate::error::{Result, WeixinError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// SQL backend on a single SQLite file. Expiry is an absolute epoch-millis
/// column; expired rows are invisible to reads and removed by
/// [`Storage::purge_expired`].
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(WeixinError::backend)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;",
        )?;
        Self::with_schema(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS storage (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                expires_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_storage_expires_at
             ON storage(expires_at);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let out = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            work(&conn)
        })
        .await??;
        Ok(out)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        let now = unix_millis_now();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM storage WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let key = key.to_string();
        let expires_at = unix_millis_now().saturating_add(duration_millis(ttl));
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO storage(key, value, expires_at)
                 VALUES(?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value, expires_at=excluded.expires_at",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM storage WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn is_expired(&self, key: &str) -> Result<bool> {
        Ok(matches!(self.ttl(key).await?, KeyTtl::Missing))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let key = key.to_string();
        let now = unix_millis_now();
        let expires_at: Option<i64> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT expires_at FROM storage WHERE key = ?1 AND expires_at > ?2",
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        Ok(match expires_at {
            Some(at) => KeyTtl::Remaining(remaining_secs(at - now)),
            None => KeyTtl::Missing,
        })
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = unix_millis_now();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM storage WHERE expires_at <= ?1", params![now])
        })
        .await
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let pattern = escape_glob_classes(pattern);
        let now = unix_millis_now();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM storage WHERE key GLOB ?1 AND expires_at > ?2 ORDER BY key",
            )?;
            let keys = stmt
                .query_map(params![pattern, now], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }
}
