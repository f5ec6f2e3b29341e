use super::{duration_millis, remaining_secs, KeyTtl, Storage};
use crate::error::{Result, WeixinError};
use async_trait::async_trait;
use bytes::Bytes;
use fred::prelude::*;
use fred::types::{ClusterHash, CustomCommand};

/// Native-TTL backend. Redis expires keys itself, so purging is a no-op.
#[derive(Clone)]
pub struct RedisStorage {
    client: Client,
}

impl RedisStorage {
    pub async fn connect(url: &str) -> Result<Self> {
        let config = Config::from_url(url).map_err(WeixinError::backend)?;
        let client = Client::new(config, None, None, None);
        client.connect();
        client
            .wait_for_connect()
            .await
            .map_err(WeixinError::backend)?;
        tracing::info!("connected to redis storage");
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

/// Redis patterns treat `\` as an escape; keep only `*` and `?` special.
fn escape_redis_classes(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        if matches!(ch, '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl Storage for RedisStorage {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value: Option<Bytes> = self.client.get(key).await.map_err(WeixinError::backend)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: std::time::Duration) -> Result<()> {
        let millis = duration_millis(ttl);
        if millis == 0 {
            return self.delete(key).await;
        }
        self.client
            .set::<(), _, _>(key, Bytes::from(value), Some(Expiration::PX(millis)), None, false)
            .await
            .map_err(WeixinError::backend)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .del::<i64, _>(key)
            .await
            .map(|_| ())
            .map_err(WeixinError::backend)
    }

    async fn is_expired(&self, key: &str) -> Result<bool> {
        let exists: bool = self.client.exists(key).await.map_err(WeixinError::backend)?;
        Ok(!exists)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let millis: i64 = self.client.pttl(key).await.map_err(WeixinError::backend)?;
        Ok(match millis {
            -2 => KeyTtl::Missing,
            ms if ms < 0 => KeyTtl::Unknown,
            ms => KeyTtl::Remaining(remaining_secs(ms)),
        })
    }

    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let command = CustomCommand::new_static("KEYS", ClusterHash::FirstKey, false);
        let mut keys: Vec<String> = self
            .client
            .custom(command, vec![escape_redis_classes(pattern)])
            .await
            .map_err(WeixinError::backend)?;
        keys.sort_unstable();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{exercise_contract, exercise_expiry, exercise_wildcards};

    async fn test_storage() -> RedisStorage {
        let url = std::env::var("WEIXIN_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
        let storage = RedisStorage::connect(&url).await.expect("redis reachable");
        for key in storage.list_keys("*").await.unwrap() {
            if key.starts_with("contract:")
                || key.starts_with("expiry:")
                || key.starts_with("wild")
                || key.starts_with("other:")
            {
                storage.delete(&key).await.unwrap();
            }
        }
        storage
    }

    #[test]
    fn redis_patterns_escape_brackets() {
        assert_eq!(escape_redis_classes("a[b]*"), "a\\[b\\]*");
        assert_eq!(escape_redis_classes("x\\y?"), "x\\\\y?");
    }

    #[tokio::test]
    #[ignore = "needs a redis server at WEIXIN_TEST_REDIS_URL"]
    async fn redis_storage_contract() {
        exercise_contract(&test_storage().await).await;
    }

    #[tokio::test]
    #[ignore = "needs a redis server at WEIXIN_TEST_REDIS_URL"]
    async fn redis_storage_expiry() {
        exercise_expiry(&test_storage().await).await;
    }

    #[tokio::test]
    #[ignore = "needs a redis server at WEIXIN_TEST_REDIS_URL"]
    async fn redis_storage_wildcards() {
        exercise_wildcards(&test_storage().await).await;
    }
}
