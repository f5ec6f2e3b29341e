//! HTTP adapter: maps the platform's callback requests onto a [`Dispatcher`].
//!
//! `GET` is the URL handshake (echo `echostr` when `signature` checks out),
//! `POST` carries a message. Library errors map to status codes here:
//! decode failures are 400, authentication failures 403, anything else 500.

use crate::dispatcher::Dispatcher;
use crate::error::WeixinError;
use crate::message::Message;
use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub nonce: String,
    pub echostr: Option<String>,
    pub msg_signature: Option<String>,
}

/// Routes for a dispatcher mounted at `path`.
pub fn router(dispatcher: Arc<Dispatcher>, path: &str) -> Router {
    Router::new()
        .route(path, get(handle_handshake).post(handle_callback))
        .with_state(dispatcher)
}

/// Bind `bind`, serve until Ctrl-C.
pub async fn serve(bind: &str, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let local = listener.local_addr().context("listener has no local address")?;
    tracing::info!("weixin gateway listening on http://{local}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("gateway server failed")
}

async fn handle_handshake(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if !dispatcher.verify(&query.nonce, &query.timestamp, &query.signature) {
        tracing::warn!("rejected handshake with invalid signature");
        return (StatusCode::FORBIDDEN, "invalid signature").into_response();
    }
    (StatusCode::OK, query.echostr.unwrap_or_default()).into_response()
}

async fn handle_callback(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> Response {
    if !dispatcher.verify(&query.nonce, &query.timestamp, &query.signature) {
        tracing::warn!("rejected callback with invalid signature");
        return (StatusCode::FORBIDDEN, "invalid signature").into_response();
    }

    if let (true, Some(msg_signature)) = (dispatcher.is_encrypted(), query.msg_signature.as_deref()) {
        if let Err(err) = check_envelope(&dispatcher, &query, msg_signature, &body) {
            return error_response(err);
        }
    }

    match dispatcher.handle(body).await {
        Ok(Some(xml)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
            xml,
        )
            .into_response(),
        Ok(None) => (StatusCode::OK, String::new()).into_response(),
        Err(err) => error_response(err),
    }
}

fn check_envelope(
    dispatcher: &Dispatcher,
    query: &CallbackQuery,
    msg_signature: &str,
    body: &str,
) -> Result<(), WeixinError> {
    let outer = Message::parse(body)?;
    let encrypt = outer.encrypted_payload().unwrap_or_default();
    if dispatcher.verify_envelope(msg_signature, &query.timestamp, &query.nonce, encrypt) {
        Ok(())
    } else {
        Err(WeixinError::Authentication("msg_signature mismatch".into()))
    }
}

fn error_response(err: WeixinError) -> Response {
    let status = match &err {
        WeixinError::Decode(_) => StatusCode::BAD_REQUEST,
        WeixinError::Authentication(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("callback failed: {err}");
    } else {
        tracing::warn!("callback rejected: {err}");
    }
    (status, status.canonical_reason().unwrap_or("error")).into_response()
}
