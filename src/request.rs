//! Per-callback request context handed to every handler.

use crate::crypto::MessageCrypto;
use crate::error::{Result, WeixinError};
use crate::message::Message;
use crate::reply::{Postmark, Reply};
use crate::session::Session;
use crate::storage::Storage;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::OnceCell;

#[derive(Default)]
struct ResponseState {
    xml: Option<String>,
    sealed: bool,
}

struct RequestInner {
    body: String,
    crypto: Option<Arc<MessageCrypto>>,
    storage: Option<Arc<dyn Storage>>,
    message: Mutex<Option<Arc<Message>>>,
    session: OnceCell<Arc<Session>>,
    response: Mutex<ResponseState>,
}

/// Raw body plus everything derived from it while handling one callback.
///
/// Cloning is cheap and clones share state, so a handler and the
/// on-finish hook observe the same message, session and response.
#[derive(Clone)]
pub struct WeixinRequest {
    inner: Arc<RequestInner>,
}

impl WeixinRequest {
    pub fn new(
        body: impl Into<String>,
        crypto: Option<Arc<MessageCrypto>>,
        storage: Option<Arc<dyn Storage>>,
    ) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                body: body.into(),
                crypto,
                storage,
                message: Mutex::new(None),
                session: OnceCell::new(),
                response: Mutex::new(ResponseState::default()),
            }),
        }
    }

    /// A request without encryption or storage.
    pub fn plain(body: impl Into<String>) -> Self {
        Self::new(body, None, None)
    }

    pub fn body(&self) -> &str {
        &self.inner.body
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.crypto.is_some()
    }

    /// Parse (and decrypt) the body on first access.
    pub fn message(&self) -> Result<Arc<Message>> {
        let mut cached = self.inner.message.lock();
        if let Some(message) = cached.as_ref() {
            return Ok(Arc::clone(message));
        }

        let message = Arc::new(self.parse_body()?);
        *cached = Some(Arc::clone(&message));
        Ok(message)
    }

    fn parse_body(&self) -> Result<Message> {
        if self.inner.body.trim().is_empty() {
            return Ok(Message::default());
        }

        let outer = Message::parse(&self.inner.body)?;
        match (outer.encrypted_payload(), self.inner.crypto.as_deref()) {
            (Some(payload), Some(crypto)) => Message::parse(&crypto.decrypt(payload)?),
            (None, None) => Ok(outer),
            (Some(_), None) => Err(WeixinError::ConfigurationMismatch(
                "message is encrypted but no EncodingAESKey is configured".into(),
            )),
            (None, Some(_)) => Err(WeixinError::ConfigurationMismatch(
                "EncodingAESKey is configured but message is not encrypted".into(),
            )),
        }
    }

    /// Attach a reply. Unmarked replies are addressed back to the sender and
    /// the rendered XML is wrapped in an envelope when encryption is on.
    pub fn respond(&self, reply: impl Into<Reply>) -> Result<()> {
        if self.is_sealed() {
            return Err(WeixinError::ResponseFinalized);
        }

        let mut reply = reply.into();
        if !reply.is_marked() {
            let message = self.message()?;
            reply = reply.postmarked(Postmark::reply_to(&message));
        }

        let mut xml = reply.to_xml();
        if let Some(crypto) = &self.inner.crypto {
            if !reply.is_encrypted() {
                xml = Reply::encrypted(crypto.encrypt(&xml)?).to_xml();
            }
        }

        let mut state = self.inner.response.lock();
        if state.sealed {
            return Err(WeixinError::ResponseFinalized);
        }
        state.xml = Some(xml);
        Ok(())
    }

    pub fn has_response(&self) -> bool {
        self.inner.response.lock().xml.is_some()
    }

    pub fn response_xml(&self) -> Option<String> {
        self.inner.response.lock().xml.clone()
    }

    pub fn response_xml_or(&self, default: impl Into<String>) -> String {
        self.response_xml().unwrap_or_else(|| default.into())
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.response.lock().sealed
    }

    pub(crate) fn seal(&self) {
        self.inner.response.lock().sealed = true;
    }

    /// The sender's session, loaded from storage on first access.
    pub async fn session(&self) -> Result<Arc<Session>> {
        let storage = self.inner.storage.as_ref().ok_or_else(|| {
            WeixinError::ConfigurationMismatch("sessions need a storage backend".into())
        })?;
        let message = self.message()?;
        let user_id = message
            .from_user_name
            .as_deref()
            .filter(|user| !user.is_empty())
            .ok_or_else(|| WeixinError::decode("message has no FromUserName"))?;

        self.inner
            .session
            .get_or_try_init(|| async {
                Session::load(Arc::clone(storage), user_id)
                    .await
                    .map(Arc::new)
            })
            .await
            .map(Arc::clone)
    }
}

impl std::fmt::Debug for WeixinRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeixinRequest")
            .field("body_len", &self.inner.body.len())
            .field("encrypted", &self.is_encrypted())
            .field("has_response", &self.has_response())
            .finish()
    }
}
