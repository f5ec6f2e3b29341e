//! Minimal client for the platform's REST API: access tokens and
//! customer-service messages.
//!
//! The access token is cached in [`Storage`] so several processes can share
//! it. Only one of them should refresh at a time; this client doesn't lock.

use crate::config::WeixinConfig;
use crate::error::{Result, WeixinError};
use crate::message::Article;
use crate::storage::{Storage, StorageExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.weixin.qq.com";
pub const ACCESS_TOKEN_KEY: &str = "weixin:ACCESS_TOKEN";
const DEFAULT_TIMEOUT_SECS: u64 = 15;

#[derive(Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_in: u64,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"***")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Body of `/cgi-bin/message/custom/send`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CustomMessage {
    touser: String,
    #[serde(flatten)]
    body: CustomBody,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "msgtype", rename_all = "lowercase")]
enum CustomBody {
    Text { text: TextContent },
    Image { image: MediaContent },
    Voice { voice: MediaContent },
    Video { video: VideoContent },
    Music { music: MusicContent },
    News { news: NewsContent },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct TextContent {
    content: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct MediaContent {
    media_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct VideoContent {
    media_id: String,
    thumb_media_id: String,
    title: String,
    description: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct MusicContent {
    title: String,
    description: String,
    musicurl: String,
    hqmusicurl: String,
    thumb_media_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct NewsContent {
    articles: Vec<NewsArticle>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct NewsArticle {
    title: String,
    description: String,
    url: String,
    picurl: String,
}

impl CustomMessage {
    fn new(to_user: impl Into<String>, body: CustomBody) -> Self {
        Self {
            touser: to_user.into(),
            body,
        }
    }

    pub fn text(to_user: impl Into<String>, content: impl Into<String>) -> Self {
        let text = TextContent {
            content: content.into(),
        };
        Self::new(to_user, CustomBody::Text { text })
    }

    pub fn image(to_user: impl Into<String>, media_id: impl Into<String>) -> Self {
        let image = MediaContent {
            media_id: media_id.into(),
        };
        Self::new(to_user, CustomBody::Image { image })
    }

    pub fn voice(to_user: impl Into<String>, media_id: impl Into<String>) -> Self {
        let voice = MediaContent {
            media_id: media_id.into(),
        };
        Self::new(to_user, CustomBody::Voice { voice })
    }

    pub fn video(
        to_user: impl Into<String>,
        media_id: impl Into<String>,
        thumb_media_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let video = VideoContent {
            media_id: media_id.into(),
            thumb_media_id: thumb_media_id.into(),
            title: title.into(),
            description: description.into(),
        };
        Self::new(to_user, CustomBody::Video { video })
    }

    pub fn music(to_user: impl Into<String>, music: &crate::reply::Music) -> Self {
        let music = MusicContent {
            title: music.title.clone(),
            description: music.description.clone(),
            musicurl: music.music_url.clone(),
            hqmusicurl: music.hq_music_url.clone(),
            thumb_media_id: music.thumb_media_id.clone(),
        };
        Self::new(to_user, CustomBody::Music { music })
    }

    pub fn news(to_user: impl Into<String>, articles: &[Article]) -> Self {
        let articles = articles
            .iter()
            .map(|article| NewsArticle {
                title: article.title.clone(),
                description: article.description.clone(),
                url: article.url.clone(),
                picurl: article.pic_url.clone(),
            })
            .collect();
        Self::new(to_user, CustomBody::News {
            news: NewsContent { articles },
        })
    }

    pub fn to_user(&self) -> &str {
        &self.touser
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    storage: Arc<dyn Storage>,
}

impl ApiClient {
    pub fn new(
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        Self::with_settings(
            app_id.into(),
            app_secret.into(),
            storage,
            DEFAULT_API_BASE_URL,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )
    }

    pub fn from_config(config: &WeixinConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        let app_secret = config.app_secret.clone().ok_or_else(|| {
            WeixinError::ConfigurationMismatch("the API client needs app_secret".into())
        })?;
        Self::with_settings(
            config.app_id.clone(),
            app_secret,
            storage,
            &config.api.base_url,
            Duration::from_secs(config.api.timeout_secs),
        )
    }

    fn with_settings(
        app_id: String,
        app_secret: String,
        storage: Arc<dyn Storage>,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id,
            app_secret,
            storage,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Ask the platform for a new token without caching it.
    pub async fn fetch_access_token(&self) -> Result<AccessToken> {
        let body = self
            .http
            .get(self.api_url("/cgi-bin/token"))
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", self.app_id.as_str()),
                ("secret", self.app_secret.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let value = check_response(&body)?;
        serde_json::from_value(value)
            .map_err(|err| WeixinError::decode(format!("unexpected token response: {err}")))
    }

    /// Fetch a token and cache it for as long as the platform says it lives.
    pub async fn refresh_access_token(&self) -> Result<String> {
        let token = self.fetch_access_token().await?;
        self.storage
            .set(
                ACCESS_TOKEN_KEY,
                &token.access_token,
                Duration::from_secs(token.expires_in),
            )
            .await?;
        tracing::info!("refreshed access token, valid for {}s", token.expires_in);
        Ok(token.access_token)
    }

    /// The cached token; an error if none is cached.
    pub async fn access_token(&self) -> Result<String> {
        self.storage
            .get::<String>(ACCESS_TOKEN_KEY)
            .await?
            .ok_or_else(|| {
                WeixinError::ConfigurationMismatch(
                    "no access token cached, refresh it first".into(),
                )
            })
    }

    pub async fn send_custom_message(&self, message: &CustomMessage) -> Result<()> {
        let token = self.access_token().await?;
        let body = self
            .http
            .post(self.api_url("/cgi-bin/message/custom/send"))
            .query(&[("access_token", token.as_str())])
            .json(message)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        check_response(&body)?;
        tracing::debug!("sent custom message to {}", message.to_user());
        Ok(())
    }
}

/// Parse a JSON reply and surface a non-zero `errcode`.
fn check_response(body: &str) -> Result<Value> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|err| WeixinError::decode(format!("invalid API response json: {err}")))?;
    let code = parsed.get("errcode").and_then(Value::as_i64).unwrap_or(0);
    if code != 0 {
        let message = parsed
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        return Err(WeixinError::Api { code, message });
    }
    Ok(parsed)
}
