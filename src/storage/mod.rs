//! Expiring key-value storage.
//!
//! Every backend stores opaque bytes with an absolute expiry and must answer
//! the same way: an expired key reads back as absent, deleting a missing key
//! is fine, and wildcard listing never returns expired keys. Typed values go
//! through [`StorageExt`], which serialises with `serde_json`.

pub mod memory;
#[cfg(feature = "storage-redis")]
pub mod redis;
pub mod sqlite;

pub use memory::MemoryStorage;
#[cfg(feature = "storage-redis")]
pub use redis::RedisStorage;
pub use sqlite::SqliteStorage;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{Result, WeixinError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time;

/// Expiry used when callers don't pick one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Absent or already expired.
    Missing,
    /// Present, but the backend can't tell how long it has left.
    Unknown,
    Remaining(u64),
}

impl KeyTtl {
    /// Integer form: `-2` for missing, `0` for unknown.
    pub fn as_secs(self) -> i64 {
        match self {
            Self::Missing => -2,
            Self::Unknown => 0,
            Self::Remaining(secs) => i64::try_from(secs).unwrap_or(i64::MAX),
        }
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    fn name(&self) -> &str;

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn is_expired(&self, key: &str) -> Result<bool> {
        Ok(self.get_raw(key).await?.is_none())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Drop expired records now. Backends with native expiry return `0`.
    async fn purge_expired(&self) -> Result<usize>;

    /// Live keys matching a glob (`*` any run, `?` one character), sorted.
    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>>;
}

/// What a [`StorageExt::get_or_set`] producer hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct Produced<T> {
    value: T,
    cacheable: bool,
}

impl<T> Produced<T> {
    /// Cache the value if it is meaningful.
    pub fn value(value: T) -> Self {
        Self {
            value,
            cacheable: true,
        }
    }

    /// Return the value without caching it.
    pub fn skip(value: T) -> Self {
        Self {
            value,
            cacheable: false,
        }
    }
}

impl<T> From<T> for Produced<T> {
    fn from(value: T) -> Self {
        Self::value(value)
    }
}

#[async_trait]
pub trait StorageExt: Storage {
    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get_raw(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| WeixinError::decode(format!("stored value for {key}: {err}"))),
            None => Ok(None),
        }
    }

    async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value)
            .map_err(|err| WeixinError::decode(format!("serialising {key}: {err}")))?;
        self.set_raw(key, bytes, ttl).await
    }

    /// Read `key`, or produce, cache and return a fresh value on a miss.
    ///
    /// Only non-empty strings, arrays and objects are cached; numbers,
    /// booleans and null are returned as-is.
    async fn get_or_set<T, F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Produced<T>>> + Send,
    {
        if let Some(value) = self.get::<T>(key).await? {
            return Ok(value);
        }

        let produced = producer().await?;
        if produced.cacheable {
            let json = serde_json::to_value(&produced.value)
                .map_err(|err| WeixinError::decode(format!("serialising {key}: {err}")))?;
            if is_meaningful(&json) {
                self.set(key, &json, ttl).await?;
            }
        }
        Ok(produced.value)
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

fn is_meaningful(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(items) => !items.is_empty(),
        serde_json::Value::Object(fields) => !fields.is_empty(),
        _ => false,
    }
}

/// Open the backend named in configuration.
pub async fn create_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStorage::open(&config.path)?)),
        #[cfg(feature = "storage-redis")]
        StorageBackend::Redis => {
            let url = config.url.as_deref().ok_or_else(|| {
                WeixinError::ConfigurationMismatch("redis storage needs storage.url".into())
            })?;
            Ok(Arc::new(RedisStorage::connect(url).await?))
        }
        #[cfg(not(feature = "storage-redis"))]
        StorageBackend::Redis => Err(WeixinError::ConfigurationMismatch(
            "redis storage requires the `storage-redis` feature".into(),
        )),
    }
}

/// Purge expired records every `interval` until the handle is aborted.
pub fn spawn_purge_task(storage: Arc<dyn Storage>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match storage.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => {
                    tracing::info!("purged {removed} expired record(s) from {}", storage.name());
                }
                Err(err) => tracing::warn!("storage purge failed on {}: {err}", storage.name()),
            }
        }
    })
}

pub(crate) fn unix_millis_now() -> i64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0));
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn duration_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Whole seconds left, rounded up so a live key never reports zero.
pub(crate) fn remaining_secs(millis: i64) -> u64 {
    u64::try_from(millis.max(0)).unwrap_or(0).div_ceil(1000)
}

/// Escape the class brackets so only `*` and `?` stay special, and fold
/// runs of `*` into one (`glob` rejects `**` inside a path component).
pub(crate) fn escape_glob_classes(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    let mut prev_star = false;
    for ch in pattern.chars() {
        match ch {
            '*' if prev_star => continue,
            '[' => escaped.push_str("[[]"),
            ']' => escaped.push_str("[]]"),
            other => escaped.push(other),
        }
        prev_star = ch == '*';
    }
    escaped
}
