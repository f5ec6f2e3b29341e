//! Handler registry and message routing.
//!
//! A message resolves to an ordered list of [`HandlerKey`]s, most specific
//! first, and the first registered key wins:
//!
//! * `MsgType=text` → `TEXT` (or the keyword router, see below)
//! * `MsgType=event, Event=CLICK, EventKey=k` → `EVENT_CLICK_K`, `EVENT_CLICK`
//! * `MsgType=event, Event=VIEW` → `EVENT_VIEW`
//!
//! Anything unmatched goes to the default handler, if one is set.
//!
//! When keyword filters are registered, `TEXT` messages are tested against
//! them in registration order; a miss goes to the text default, then to a
//! plain `TEXT` handler, then to the global default.

use crate::crypto::{Credential, MessageCrypto};
use crate::error::{Result, WeixinError};
use crate::message::Message;
use crate::reply::Reply;
use crate::request::WeixinRequest;
use crate::signature;
use crate::storage::Storage;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Events that carry a sub-key worth routing on.
const KEYED_EVENTS: [&str; 3] = ["CLICK", "SCAN", "SUBSCRIBE"];

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<Reply>>> + Send>>;

/// Values a handler may resolve to.
pub trait IntoReply {
    fn into_reply(self) -> Option<Reply>;
}

impl IntoReply for () {
    fn into_reply(self) -> Option<Reply> {
        None
    }
}

impl IntoReply for Reply {
    fn into_reply(self) -> Option<Reply> {
        Some(self)
    }
}

impl IntoReply for Option<Reply> {
    fn into_reply(self) -> Option<Reply> {
        self
    }
}

impl IntoReply for String {
    fn into_reply(self) -> Option<Reply> {
        Some(Reply::text(self))
    }
}

impl IntoReply for &'static str {
    fn into_reply(self) -> Option<Reply> {
        Some(Reply::text(self))
    }
}

pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: WeixinRequest) -> HandlerFuture;
}

impl<F, Fut, R> Handler for F
where
    F: Fn(WeixinRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: IntoReply,
{
    fn call(&self, req: WeixinRequest) -> HandlerFuture {
        let fut = self(req);
        Box::pin(async move { fut.await.map(IntoReply::into_reply) })
    }
}

/// Canonical, upper-cased routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey(String);

impl HandlerKey {
    pub fn new(key: &str) -> Self {
        Self(key.trim().to_uppercase())
    }

    pub fn message(msg_type: &str) -> Self {
        Self::new(msg_type)
    }

    pub fn event(event: &str) -> Self {
        Self::new(&format!("EVENT_{}", event.trim()))
    }

    pub fn event_key(event: &str, key: &str) -> Self {
        Self::new(&format!("EVENT_{}_{}", event.trim(), key.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Candidate keys for `message`, most specific first.
    pub fn resolve(message: &Message) -> Vec<Self> {
        let msg_type = message.msg_type.as_deref().unwrap_or("").trim();
        if msg_type.is_empty() {
            return Vec::new();
        }
        let base = Self::message(msg_type);
        if base.as_str() != "EVENT" {
            return vec![base];
        }

        let event = message.event.as_deref().unwrap_or("").trim().to_uppercase();
        let mut keys = Vec::with_capacity(2);
        if KEYED_EVENTS.contains(&event.as_str()) {
            let sub_key = message
                .event_key
                .as_deref()
                .filter(|key| !key.trim().is_empty())
                .or(message.scene.as_deref())
                .filter(|key| !key.trim().is_empty());
            if let Some(sub_key) = sub_key {
                keys.push(Self::event_key(&event, sub_key));
            }
        }
        keys.push(Self::event(&event));
        keys
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Text keyword filter, matched against the whole `Content` with
/// surrounding whitespace ignored.
#[derive(Debug, Clone)]
pub struct TextFilter {
    source: String,
}

impl TextFilter {
    /// Any of the given literal keywords.
    pub fn keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let alternatives: Vec<String> = keywords
            .into_iter()
            .map(|keyword| regex::escape(keyword.as_ref()))
            .collect();
        Self {
            source: alternatives.join("|"),
        }
    }

    /// A regular expression; it is anchored for you.
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            source: pattern.into(),
        }
    }

    fn compile(&self) -> Result<Regex> {
        Ok(Regex::new(&format!(r"^\s*(?:{})\s*$", self.source))?)
    }
}

pub struct DispatcherBuilder {
    token: String,
    credential: Option<(String, String)>,
    storage: Option<Arc<dyn Storage>>,
    handlers: HashMap<HandlerKey, Arc<dyn Handler>>,
    text_filters: Vec<(TextFilter, Arc<dyn Handler>)>,
    text_default: Option<Arc<dyn Handler>>,
    default_handler: Option<Arc<dyn Handler>>,
    on_finish: Option<Arc<dyn Handler>>,
}

impl DispatcherBuilder {
    /// Turn on envelope encryption for this app.
    pub fn credential(mut self, app_id: impl Into<String>, encoding_aes_key: impl Into<String>) -> Self {
        self.credential = Some((app_id.into(), encoding_aes_key.into()));
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn on(mut self, key: &str, handler: impl Handler) -> Self {
        self.handlers.insert(HandlerKey::new(key), Arc::new(handler));
        self
    }

    pub fn on_message(self, msg_type: &str, handler: impl Handler) -> Self {
        let key = HandlerKey::message(msg_type);
        self.on_key(key, handler)
    }

    pub fn on_event(self, event: &str, handler: impl Handler) -> Self {
        let key = HandlerKey::event(event);
        self.on_key(key, handler)
    }

    pub fn on_event_key(self, event: &str, event_key: &str, handler: impl Handler) -> Self {
        let key = HandlerKey::event_key(event, event_key);
        self.on_key(key, handler)
    }

    fn on_key(mut self, key: HandlerKey, handler: impl Handler) -> Self {
        self.handlers.insert(key, Arc::new(handler));
        self
    }

    pub fn text_filter(mut self, filter: TextFilter, handler: impl Handler) -> Self {
        self.text_filters.push((filter, Arc::new(handler)));
        self
    }

    pub fn text_default(mut self, handler: impl Handler) -> Self {
        self.text_default = Some(Arc::new(handler));
        self
    }

    pub fn default_handler(mut self, handler: impl Handler) -> Self {
        self.default_handler = Some(Arc::new(handler));
        self
    }

    /// Runs after every dispatched message, once the response is rendered.
    /// Its result is ignored.
    pub fn on_finish(mut self, handler: impl Handler) -> Self {
        self.on_finish = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Dispatcher> {
        let crypto = match self.credential {
            Some((app_id, encoding_aes_key)) => {
                let credential = Credential::new(&app_id, &self.token, &encoding_aes_key)?;
                Some(Arc::new(MessageCrypto::new(credential)))
            }
            None => None,
        };

        let text_filters = self
            .text_filters
            .into_iter()
            .map(|(filter, handler)| Ok((filter.compile()?, handler)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Dispatcher {
            token: self.token,
            crypto,
            storage: self.storage,
            handlers: self.handlers,
            text_filters,
            text_default: self.text_default,
            default_handler: self.default_handler,
            on_finish: self.on_finish,
        })
    }
}

/// Routes callback bodies to handlers and renders their replies.
pub struct Dispatcher {
    token: String,
    crypto: Option<Arc<MessageCrypto>>,
    storage: Option<Arc<dyn Storage>>,
    handlers: HashMap<HandlerKey, Arc<dyn Handler>>,
    text_filters: Vec<(Regex, Arc<dyn Handler>)>,
    text_default: Option<Arc<dyn Handler>>,
    default_handler: Option<Arc<dyn Handler>>,
    on_finish: Option<Arc<dyn Handler>>,
}

impl Dispatcher {
    pub fn builder(token: impl Into<String>) -> DispatcherBuilder {
        DispatcherBuilder {
            token: token.into(),
            credential: None,
            storage: None,
            handlers: HashMap::new(),
            text_filters: Vec::new(),
            text_default: None,
            default_handler: None,
            on_finish: None,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn crypto(&self) -> Option<&Arc<MessageCrypto>> {
        self.crypto.as_ref()
    }

    pub fn storage(&self) -> Option<&Arc<dyn Storage>> {
        self.storage.as_ref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some()
    }

    /// Plain `signature` check used by the URL handshake and POST gate.
    pub fn verify(&self, nonce: &str, timestamp: &str, signature: &str) -> bool {
        signature::is_valid_request(&self.token, nonce, timestamp, signature)
    }

    /// `msg_signature` check; always false when encryption is off.
    pub fn verify_envelope(
        &self,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
        encrypt: &str,
    ) -> bool {
        self.crypto
            .as_ref()
            .is_some_and(|crypto| crypto.verify_envelope(msg_signature, timestamp, nonce, encrypt))
    }

    pub fn request(&self, body: impl Into<String>) -> WeixinRequest {
        WeixinRequest::new(body, self.crypto.clone(), self.storage.clone())
    }

    /// Dispatch a raw callback body; `None` means "no reply".
    pub async fn handle(&self, body: impl Into<String>) -> Result<Option<String>> {
        self.dispatch(self.request(body)).await
    }

    pub async fn dispatch(&self, req: WeixinRequest) -> Result<Option<String>> {
        let message = req.message()?;
        let Some((route, handler)) = self.route(&message) else {
            tracing::debug!("no MsgType in callback body, nothing to dispatch");
            return Ok(None);
        };
        tracing::debug!("dispatching callback to {route}");

        let outcome = match handler {
            Some(handler) => match handler.call(req.clone()).await {
                Ok(Some(reply)) if !req.has_response() => req.respond(reply),
                Ok(_) => Ok(()),
                Err(err) => Err(err
                    .downcast::<WeixinError>()
                    .unwrap_or_else(WeixinError::Handler)),
            },
            None => Ok(()),
        };
        req.seal();

        if let Some(on_finish) = &self.on_finish {
            if let Err(err) = on_finish.call(req.clone()).await {
                tracing::warn!("on_finish hook failed for {route}: {err:#}");
            }
        }

        outcome?;
        Ok(req.response_xml())
    }

    /// Pick the handler for `message`. `None` when there is no `MsgType`;
    /// `Some((route, None))` when nothing, not even a default, is registered.
    fn route(&self, message: &Message) -> Option<(String, Option<Arc<dyn Handler>>)> {
        let keys = HandlerKey::resolve(message);
        let base = keys.last()?;

        if base.as_str() == "TEXT" && !self.text_filters.is_empty() {
            let content = message.content_or_empty();
            if let Some(handler) = self
                .text_filters
                .iter()
                .find(|(pattern, _)| pattern.is_match(content))
                .map(|(_, handler)| handler)
            {
                return Some(("TEXT keyword filter".to_string(), Some(Arc::clone(handler))));
            }
            let fallback = self
                .text_default
                .as_ref()
                .or_else(|| self.handlers.get(base))
                .or(self.default_handler.as_ref())
                .cloned();
            return Some(("TEXT keyword default".to_string(), fallback));
        }

        for key in &keys {
            if let Some(handler) = self.handlers.get(key) {
                return Some((key.to_string(), Some(Arc::clone(handler))));
            }
        }
        Some((
            format!("default handler ({base})"),
            self.default_handler.clone(),
        ))
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.handlers.keys().map(HandlerKey::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("Dispatcher")
            .field("encrypted", &self.is_encrypted())
            .field("handlers", &keys)
            .field("text_filters", &self.text_filters.len())
            .field("storage", &self.storage.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}
