use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::client::DEFAULT_API_BASE_URL;

/// Which [`Storage`](crate::storage::Storage) backend to open.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Database file for the sqlite backend.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Connection URL for the redis backend.
    #[serde(default)]
    pub url: Option<String>,

    /// How often the server purges expired rows. `0` disables the task.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/weixin.db")
}

fn default_purge_interval() -> u64 {
    600
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
            url: None,
            purge_interval_secs: default_purge_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Path the platform posts callbacks to.
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_path() -> String {
    "/weixin".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            path: default_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_timeout() -> u64 {
    15
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Top-level configuration, loaded from `weixin.toml`.
///
/// Only `token` is required; `app_id` is needed once encryption or the API
/// client is used.
#[derive(Clone, Serialize, Deserialize)]
pub struct WeixinConfig {
    #[serde(default)]
    pub app_id: String,

    pub token: String,

    /// 43-character key from the platform console. Setting it turns on
    /// message encryption.
    #[serde(default)]
    pub encoding_aes_key: Option<String>,

    #[serde(default)]
    pub app_secret: Option<String>,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

impl WeixinConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            anyhow::bail!("token must not be empty");
        }
        if self.encoding_aes_key.is_some() && self.app_id.trim().is_empty() {
            anyhow::bail!("encoding_aes_key requires app_id");
        }
        if self.app_secret.is_some() && self.app_id.trim().is_empty() {
            anyhow::bail!("app_secret requires app_id");
        }
        if self.storage.backend == StorageBackend::Redis && self.storage.url.is_none() {
            anyhow::bail!("storage.backend = \"redis\" requires storage.url");
        }
        if !self.gateway.path.starts_with('/') {
            anyhow::bail!("gateway.path must start with '/'");
        }
        Ok(())
    }
}

impl std::fmt::Debug for WeixinConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "***");
        f.debug_struct("WeixinConfig")
            .field("app_id", &self.app_id)
            .field("token", &"***")
            .field("encoding_aes_key", &redact(&self.encoding_aes_key))
            .field("app_secret", &redact(&self.app_secret))
            .field("gateway", &self.gateway)
            .field("storage", &self.storage)
            .field("api", &self.api)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = WeixinConfig::from_toml_str("app_id = \"wx1\"\ntoken = \"tok\"\n").unwrap();
        assert_eq!(config.app_id, "wx1");
        assert_eq!(config.encoding_aes_key, None);
        assert_eq!(config.gateway.bind, "127.0.0.1:8080");
        assert_eq!(config.gateway.path, "/weixin");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.purge_interval_secs, 600);
        assert_eq!(config.api.base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn full_config_parses() {
        let config = WeixinConfig::from_toml_str(
            r#"
            app_id = "wx1"
            token = "tok"
            encoding_aes_key = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
            app_secret = "sec"

            [gateway]
            bind = "0.0.0.0:9000"
            path = "/wx"

            [storage]
            backend = "sqlite"
            path = "/tmp/wx.db"
            purge_interval_secs = 30

            [api]
            base_url = "http://localhost:1234"
            timeout_secs = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.storage.path, PathBuf::from("/tmp/wx.db"));
        assert_eq!(config.gateway.bind, "0.0.0.0:9000");
        assert_eq!(config.api.timeout_secs, 3);
    }

    #[test]
    fn validation_rejects_inconsistent_settings() {
        assert!(WeixinConfig::from_toml_str("token = \"\"").is_err());
        assert!(WeixinConfig::from_toml_str("token = \"t\"\nencoding_aes_key = \"k\"").is_err());
        assert!(
            WeixinConfig::from_toml_str("token = \"t\"\n[storage]\nbackend = \"redis\"").is_err()
        );
        assert!(WeixinConfig::from_toml_str("token = \"t\"\n[gateway]\npath = \"wx\"").is_err());
        assert!(WeixinConfig::from_toml_str("app_id = \"wx\"").is_err());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = WeixinConfig::from_toml_str(
            "app_id = \"wx1\"\ntoken = \"supersecret\"\napp_secret = \"hidden\"",
        )
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("supersecret"));
        assert!(!debug.contains("hidden"));
        assert!(debug.contains("wx1"));
    }

    #[test]
    fn load_reads_file_and_reports_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "token = \"tok\"").unwrap();
        let config = WeixinConfig::load(file.path()).unwrap();
        assert_eq!(config.token, "tok");

        let err = WeixinConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/definitely/not/here.toml"));
    }
}
