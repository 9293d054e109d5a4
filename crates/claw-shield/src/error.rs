//! Error types for request protection.
//!
//! Every rejection the shield produces is a [`ShieldError`]. The variants map
//! one-to-one onto the HTTP responses the middleware sends, so a handler can
//! return `Result<Response, ShieldError>` and let axum render the rejection.

use std::net::IpAddr;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::signature::AttackCategory;

/// Message sent with every 429 response.
pub const TOO_MANY_ATTEMPTS_MESSAGE: &str = "Too many failed attempts. IP blocked temporarily.";

/// Message sent with every 403 response.
pub const SUSPICIOUS_ACTIVITY_MESSAGE: &str = "Access denied due to suspicious activity";

/// Message sent with every 413 response.
pub const PAYLOAD_TOO_LARGE_MESSAGE: &str = "Request entity too large";

/// Errors that can occur in request protection.
#[derive(Debug, Error)]
pub enum ShieldError {
    /// Source is currently blocked.
    #[error("IP {ip} is blocked, retry after {retry_after_secs}s")]
    Blocked {
        /// The blocked source.
        ip: IpAddr,
        /// Seconds until the block lifts.
        retry_after_secs: u64,
    },

    /// An attempt counter went over its limit.
    #[error("Too many attempts for {key}: limit {limit}")]
    TooManyAttempts {
        /// The attempt key that overflowed.
        key: String,
        /// The configured maximum.
        limit: u32,
        /// Seconds until the caller may retry.
        retry_after_secs: u64,
    },

    /// Source crossed the suspicion threshold on this request.
    #[error("Suspicious activity from {ip}: {category}")]
    SuspiciousActivity {
        /// The escalated source.
        ip: IpAddr,
        /// Category of the match that triggered escalation.
        category: AttackCategory,
    },

    /// Declared request body is over the size cap.
    #[error("Payload too large: {size} bytes exceeds {max}")]
    PayloadTooLarge {
        /// Declared content length.
        size: u64,
        /// Configured cap.
        max: u64,
    },

    /// The classifier could not inspect the request.
    #[error("Classification error: {0}")]
    Classification(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for shield operations.
pub type ShieldResult<T> = Result<T, ShieldError>;

impl ShieldError {
    /// HTTP status this rejection is rendered with.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Blocked { .. } | Self::TooManyAttempts { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::SuspiciousActivity { .. } | Self::Classification(_) => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Retry hint in seconds, for rejections that carry one.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Blocked { retry_after_secs, .. }
            | Self::TooManyAttempts { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// JSON body of a rejection.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectionBody {
    success: bool,
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl IntoResponse for ShieldError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Blocked { .. } | Self::TooManyAttempts { .. } => TOO_MANY_ATTEMPTS_MESSAGE,
            Self::SuspiciousActivity { .. } | Self::Classification(_) => {
                SUSPICIOUS_ACTIVITY_MESSAGE
            }
            Self::PayloadTooLarge { .. } => PAYLOAD_TOO_LARGE_MESSAGE,
            Self::Config(_) => "Internal server error",
        };
        let retry_after = self.retry_after_secs();

        let body = RejectionBody {
            success: false,
            error: message,
            retry_after,
        };
        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"success":false,"error":"Internal server error"}"#.to_string()
        });

        let mut response = (status, [(header::CONTENT_TYPE, "application/json")], json)
            .into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_blocked_response() {
        let err = ShieldError::Blocked {
            ip: "1.2.3.4".parse().unwrap(),
            retry_after_secs: 120,
        };
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "120");

        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], TOO_MANY_ATTEMPTS_MESSAGE);
        assert_eq!(json["retryAfter"], 120);
    }

    #[tokio::test]
    async fn test_suspicious_activity_response() {
        let err = ShieldError::SuspiciousActivity {
            ip: "1.2.3.4".parse().unwrap(),
            category: AttackCategory::SqlInjection,
        };
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = body_json(response).await;
        assert_eq!(json["error"], SUSPICIOUS_ACTIVITY_MESSAGE);
        assert!(json.get("retryAfter").is_none());
    }

    #[tokio::test]
    async fn test_payload_too_large_response() {
        let err = ShieldError::PayloadTooLarge { size: 20, max: 10 };
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let json = body_json(response).await;
        assert_eq!(json["error"], PAYLOAD_TOO_LARGE_MESSAGE);
    }

    #[test]
    fn test_config_error_is_internal() {
        let err = ShieldError::Config("bad".into());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_error_display_too_many_attempts() {
        let err = ShieldError::TooManyAttempts {
            key: "1.2.3.4:/api/auth/login".into(),
            limit: 5,
            retry_after_secs: 3600,
        };
        let msg = err.to_string();
        assert!(msg.contains("1.2.3.4:/api/auth/login"));
        assert!(msg.contains("limit 5"));
        assert_eq!(err.retry_after_secs(), Some(3600));
    }
}
