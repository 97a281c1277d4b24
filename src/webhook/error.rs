// SPDX-License-Identifier: AGPL-3.0-or-later

//! Errors returned to the webhook sender

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    /// The `X-GitHub-Event` header names something other than a pull request
    #[error("unsupported event type: {0}")]
    UnsupportedEventType(String),

    /// No webhook secret is configured, so nothing can be verified
    #[error("webhook secret is not configured")]
    MissingSecret,

    #[error("missing signature header")]
    MissingSignature,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl WebhookError {
    /// Only a wrong event type is the sender's fault; every other failure
    /// is reported as a server error
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::UnsupportedEventType(_) => StatusCode::BAD_REQUEST,
            Self::MissingSecret
            | Self::MissingSignature
            | Self::InvalidSignature
            | Self::InvalidPayload(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let body = match &self {
            Self::UnsupportedEventType(_) => "Unsupported event type",
            Self::MissingSecret => "Internal server error",
            Self::MissingSignature | Self::InvalidSignature => "Invalid signature",
            Self::InvalidPayload(_) => "Invalid payload",
        };
        (self.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            WebhookError::UnsupportedEventType("push".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WebhookError::MissingSecret.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            WebhookError::InvalidSignature.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            WebhookError::InvalidPayload("eof".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_response_hides_details() {
        let response = WebhookError::InvalidPayload("line 1 column 2".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
