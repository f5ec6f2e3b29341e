//! Toolkit for WeChat official-account callbacks.
//!
//! Authenticates and decrypts inbound callbacks, routes them to handlers,
//! renders (and re-encrypts) replies, and keeps per-user sessions in an
//! expiring key-value store.
//!
//! ```no_run
//! use std::sync::Arc;
//! use weixin::{Dispatcher, Reply, WeixinRequest};
//!
//! async fn echo(req: WeixinRequest) -> anyhow::Result<Reply> {
//!     let message = req.message()?;
//!     Ok(Reply::text(message.content_or_empty().to_string()))
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let dispatcher = Dispatcher::builder("token")
//!     .on_message("text", echo)
//!     .build()?;
//! let app = weixin::gateway::router(Arc::new(dispatcher), "/weixin");
//! weixin::gateway::serve("127.0.0.1:8080", app).await
//! # }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod message;
pub mod reply;
pub mod request;
pub mod session;
pub mod signature;
pub mod storage;

pub use client::{ApiClient, CustomMessage};
pub use config::WeixinConfig;
pub use crypto::{Credential, Envelope, MessageCrypto};
pub use dispatcher::{Dispatcher, DispatcherBuilder, Handler, HandlerKey, IntoReply, TextFilter};
pub use error::{Result, WeixinError};
pub use message::{Article, Message};
pub use reply::{Music, Postmark, Reply, Video};
pub use request::WeixinRequest;
pub use session::Session;
pub use storage::{KeyTtl, Storage, StorageExt};
