use std::error::Error as StdError;

/// Every failure the callback pipeline can surface to the serving layer.
///
/// A missing key, field or session value is never an error; those read back
/// as `None`.
#[derive(Debug, thiserror::Error)]
pub enum WeixinError {
    /// Malformed base64, ciphertext, padding, XML or text encoding.
    #[error("decode error: {0}")]
    Decode(String),

    /// Signature or app id did not match.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The message and the configured credential disagree about encryption,
    /// or an operation needs a collaborator that was never configured.
    #[error("configuration mismatch: {0}")]
    ConfigurationMismatch(String),

    /// Failure of the underlying store, passed through untouched.
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),

    #[error("invalid text filter pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// A reply was attached after the response had already been rendered.
    #[error("response already finalized")]
    ResponseFinalized,

    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),

    /// The platform API answered with a non-zero `errcode`.
    #[error("platform API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl WeixinError {
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::Backend(err.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }
}

impl From<rusqlite::Error> for WeixinError {
    fn from(err: rusqlite::Error) -> Self {
        Self::backend(err)
    }
}

impl From<tokio::task::JoinError> for WeixinError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::backend(err)
    }
}

pub type Result<T, E = WeixinError> = std::result::Result<T, E>;
