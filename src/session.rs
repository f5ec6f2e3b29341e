//! Per-user session bag persisted in [`Storage`].
//!
//! A session loads its whole map when created and writes the whole map back
//! on [`Session::save`]. Two sessions for the same user don't see each
//! other's unsaved writes, and the last save wins.

use crate::error::Result;
use crate::storage::{Storage, StorageExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(7 * 86_400);

const SESSION_KEY_PREFIX: &str = "session:";

pub fn session_key(user_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{user_id}")
}

pub struct Session {
    key: String,
    storage: Arc<dyn Storage>,
    data: Mutex<HashMap<String, String>>,
}

impl Session {
    pub async fn load(storage: Arc<dyn Storage>, user_id: &str) -> Result<Self> {
        let key = session_key(user_id);
        let data = storage
            .get::<HashMap<String, String>>(&key)
            .await?
            .unwrap_or_default();
        Ok(Self {
            key,
            storage,
            data: Mutex::new(data),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self, field: &str) -> Option<String> {
        self.data.lock().get(field).cloned()
    }

    pub fn set(&self, field: impl Into<String>, value: impl Into<String>) {
        self.data.lock().insert(field.into(), value.into());
    }

    pub fn remove(&self, field: &str) -> Option<String> {
        self.data.lock().remove(field)
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.data.lock().clone()
    }

    /// Replace the stored map with this session's map.
    pub async fn save(&self, ttl: Duration) -> Result<()> {
        let data = self.snapshot();
        self.storage.set(&self.key, &data, ttl).await
    }

    pub async fn destroy(&self) -> Result<()> {
        self.data.lock().clear();
        self.storage.delete(&self.key).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("storage", &self.storage.name())
            .field("fields", &self.data.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, SqliteStorage};

    async fn persists_and_destroys(storage: Arc<dyn Storage>) {
        let session = Session::load(Arc::clone(&storage), "openid-1").await.unwrap();
        assert!(session.is_empty());
        session.set("step", "2");
        session.set("city", "广州");
        session.save(Duration::from_secs(30)).await.unwrap();

        let reloaded = Session::load(Arc::clone(&storage), "openid-1").await.unwrap();
        assert_eq!(reloaded.get("step").as_deref(), Some("2"));
        assert_eq!(reloaded.get("city").as_deref(), Some("广州"));
        assert_eq!(reloaded.get("missing"), None);

        reloaded.destroy().await.unwrap();
        assert!(reloaded.is_empty());
        let fresh = Session::load(storage, "openid-1").await.unwrap();
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn session_roundtrip_on_memory() {
        persists_and_destroys(Arc::new(MemoryStorage::new())).await;
    }

    #[tokio::test]
    async fn session_roundtrip_on_sqlite() {
        persists_and_destroys(Arc::new(SqliteStorage::in_memory().unwrap())).await;
    }

    #[tokio::test]
    async fn unsaved_writes_stay_local_and_last_save_wins() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let a = Session::load(Arc::clone(&storage), "u").await.unwrap();
        let b = Session::load(Arc::clone(&storage), "u").await.unwrap();

        a.set("from", "a");
        assert_eq!(b.get("from"), None);

        a.save(DEFAULT_SESSION_TTL).await.unwrap();
        b.set("other", "b");
        b.save(DEFAULT_SESSION_TTL).await.unwrap();

        let c = Session::load(storage, "u").await.unwrap();
        assert_eq!(c.get("from"), None);
        assert_eq!(c.get("other").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn removed_fields_are_gone_after_save() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let session = Session::load(Arc::clone(&storage), "u").await.unwrap();
        session.set("step", "1");
        session.set("keep", "yes");
        session.save(DEFAULT_SESSION_TTL).await.unwrap();

        assert_eq!(session.remove("step").as_deref(), Some("1"));
        assert_eq!(session.remove("step"), None);
        session.save(DEFAULT_SESSION_TTL).await.unwrap();

        let reloaded = Session::load(storage, "u").await.unwrap();
        assert_eq!(reloaded.get("step"), None);
        assert_eq!(reloaded.get("keep").as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn sessions_are_keyed_by_user() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let session = Session::load(Arc::clone(&storage), "abc").await.unwrap();
        assert_eq!(session.key(), "session:abc");
        session.set("k", "v");
        session.save(DEFAULT_SESSION_TTL).await.unwrap();
        assert_eq!(
            storage.list_keys("session:*").await.unwrap(),
            vec!["session:abc".to_string()]
        );
    }
}
