// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP endpoint that accepts pull request webhooks
//!
//! A delivery is checked synchronously (event type, signature, payload) and
//! then queued; reviewing happens later on a worker, so the sender always
//! gets a fast answer.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::github::{verify_webhook_signature, PullRequestEvent, PULL_REQUEST_EVENT};
use crate::licenses::LicenseRegistry;
use crate::queue::JobQueue;

mod error;

pub use error::WebhookError;

pub const EVENT_HEADER: &str = "x-github-event";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Clone)]
pub struct WebhookState {
    pub queue: JobQueue<PullRequestEvent>,
    pub secret: Option<Arc<str>>,
    pub licenses: Arc<LicenseRegistry>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", post(receive))
        .route("/healthz", get(health))
        .with_state(state)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Check a delivery and decode it; the signature is verified before the
/// body is parsed
pub fn accept(
    headers: &HeaderMap,
    body: &[u8],
    secret: Option<&str>,
) -> Result<PullRequestEvent, WebhookError> {
    let event = header(headers, EVENT_HEADER).unwrap_or_default();
    if event != PULL_REQUEST_EVENT {
        return Err(WebhookError::UnsupportedEventType(event.to_string()));
    }

    let secret = secret.ok_or(WebhookError::MissingSecret)?;
    let signature = header(headers, SIGNATURE_HEADER).ok_or(WebhookError::MissingSignature)?;
    if !verify_webhook_signature(body, signature, secret) {
        return Err(WebhookError::InvalidSignature);
    }

    serde_json::from_slice(body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))
}

async fn receive(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, WebhookError> {
    let event = accept(&headers, &body, state.secret.as_deref()).map_err(|e| {
        warn!("Rejected webhook delivery: {}", e);
        e
    })?;

    debug!(
        pr = event.pull_request.number,
        action = ?event.action,
        "Queued pull request event"
    );
    state.queue.enqueue(event);
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
struct Health {
    version: &'static str,
    licenses: usize,
    license_list_version: Option<String>,
}

async fn health(State(state): State<WebhookState>) -> Json<Health> {
    Json(Health {
        version: env!("CARGO_PKG_VERSION"),
        licenses: state.licenses.len(),
        license_list_version: state.licenses.version(),
    })
}
