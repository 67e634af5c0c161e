//! GCP error types following Google Cloud API error conventions.
//!
//! Google Cloud APIs return errors in a consistent JSON format with
//! `error.code`, `error.message`, and `error.status` fields. This module
//! provides a unified error type that can represent errors from any GCP
//! service, plus the two synthetic statuses produced by the operation
//! poller.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status attached to errors raised when a finished operation carries an error payload.
pub const OPERATION_FAILED: &str = "OPERATION_FAILED";
/// Status attached to errors raised when polling exceeds its deadline.
pub const OPERATION_TIMEOUT: &str = "OPERATION_TIMEOUT";

/// Top-level error type for all GCP calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GcpError {
    /// The HTTP status code (e.g., 400, 403, 404, 409, 500).
    pub code: u16,
    /// Human-readable error message.
    pub message: String,
    /// gRPC status string (e.g., "INVALID_ARGUMENT", "PERMISSION_DENIED").
    pub status: String,
    /// The GCP service that returned the error (e.g., "pubsub", "run").
    pub service: String,
    /// The API method that failed (e.g., "subscriptions.create").
    pub method: Option<String>,
    /// Whether this error is retryable (429, 500, 503).
    pub retryable: bool,
}

impl fmt::Display for GcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GCP {} error [{}]: {} (HTTP {})",
            self.service, self.status, self.message, self.code
        )?;
        if let Some(ref method) = self.method {
            write!(f, " [Method: {}]", method)?;
        }
        Ok(())
    }
}

impl std::error::Error for GcpError {}

impl GcpError {
    /// Create a new GCP error.
    pub fn new(service: &str, code: u16, status: &str, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
            status: status.to_string(),
            service: service.to_string(),
            method: None,
            retryable: matches!(code, 429 | 500 | 503),
        }
    }

    /// Create from a transport or decoding failure with service context.
    pub fn from_str(service: &str, msg: &str) -> Self {
        Self {
            code: 500,
            message: msg.to_string(),
            status: "INTERNAL".to_string(),
            service: service.to_string(),
            method: None,
            retryable: false,
        }
    }

    /// Authentication error.
    pub fn auth_error(msg: &str) -> Self {
        Self {
            code: 401,
            message: msg.to_string(),
            status: "UNAUTHENTICATED".to_string(),
            service: "auth".to_string(),
            method: None,
            retryable: false,
        }
    }

    /// Permission denied error.
    pub fn permission_denied(service: &str, msg: &str) -> Self {
        Self::new(service, 403, "PERMISSION_DENIED", msg)
    }

    /// Resource missing.
    pub fn not_found(service: &str, msg: &str) -> Self {
        Self::new(service, 404, "NOT_FOUND", msg)
    }

    /// Resource already present.
    pub fn already_exists(service: &str, msg: &str) -> Self {
        Self::new(service, 409, "ALREADY_EXISTS", msg)
    }

    /// A long-running operation finished with an error payload.
    pub fn operation_failed(service: &str, code: u16, msg: &str) -> Self {
        Self {
            code,
            message: msg.to_string(),
            status: OPERATION_FAILED.to_string(),
            service: service.to_string(),
            method: None,
            retryable: false,
        }
    }

    /// A long-running operation did not finish before its deadline.
    pub fn operation_timeout(service: &str, operation: &str, waited_secs: u64) -> Self {
        Self {
            code: 408,
            message: format!(
                "operation {} did not complete within {}s",
                operation, waited_secs
            ),
            status: OPERATION_TIMEOUT.to_string(),
            service: service.to_string(),
            method: None,
            retryable: false,
        }
    }

    /// Parse a GCP API error from a JSON response body.
    pub fn from_api_response(service: &str, status_code: u16, body: &str) -> Self {
        // GCP APIs return: { "error": { "code": N, "message": "...", "status": "..." } }
        #[derive(Deserialize)]
        struct ApiErrorInner {
            code: Option<u16>,
            message: Option<String>,
            status: Option<String>,
        }
        #[derive(Deserialize)]
        struct ApiErrorWrapper {
            error: Option<ApiErrorInner>,
        }

        if let Ok(wrapper) = serde_json::from_str::<ApiErrorWrapper>(body) {
            if let Some(err) = wrapper.error {
                let code = err.code.unwrap_or(status_code);
                return Self {
                    code,
                    message: err.message.unwrap_or_else(|| "Unknown error".to_string()),
                    status: err.status.unwrap_or_else(|| "UNKNOWN".to_string()),
                    service: service.to_string(),
                    method: None,
                    retryable: matches!(code, 429 | 500 | 503),
                };
            }
        }

        Self {
            code: status_code,
            message: if body.is_empty() {
                format!("HTTP {}", status_code)
            } else {
                body.chars().take(500).collect()
            },
            status: "UNKNOWN".to_string(),
            service: service.to_string(),
            method: None,
            retryable: matches!(status_code, 429 | 500 | 503),
        }
    }

    /// Set the method that failed.
    pub fn with_method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }

    pub fn is_already_exists(&self) -> bool {
        self.code == 409
    }

    pub fn is_not_found(&self) -> bool {
        self.code == 404
    }

    pub fn is_permission_denied(&self) -> bool {
        self.code == 403
    }

    pub fn is_operation_failed(&self) -> bool {
        self.status == OPERATION_FAILED
    }

    pub fn is_operation_timeout(&self) -> bool {
        self.status == OPERATION_TIMEOUT
    }
}

/// Convenience type alias for GCP results.
pub type GcpResult<T> = Result<T, GcpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = GcpError::new("pubsub", 409, "ALREADY_EXISTS", "Resource already exists");
        let s = err.to_string();
        assert!(s.contains("pubsub"));
        assert!(s.contains("ALREADY_EXISTS"));
        assert!(s.contains("409"));
    }

    #[test]
    fn error_display_with_method() {
        let err = GcpError::not_found("run", "service missing").with_method("services.get");
        assert!(err.to_string().contains("services.get"));
    }

    #[test]
    fn parse_api_error_envelope() {
        let body = r#"{"error":{"code":403,"message":"Permission denied on resource","status":"PERMISSION_DENIED"}}"#;
        let err = GcpError::from_api_response("cloudscheduler", 403, body);
        assert_eq!(err.code, 403);
        assert_eq!(err.status, "PERMISSION_DENIED");
        assert!(err.is_permission_denied());
        assert!(!err.retryable);
    }

    #[test]
    fn parse_non_json_body() {
        let err = GcpError::from_api_response("storage", 503, "upstream unavailable");
        assert_eq!(err.code, 503);
        assert_eq!(err.status, "UNKNOWN");
        assert_eq!(err.message, "upstream unavailable");
        assert!(err.retryable);
    }

    #[test]
    fn parse_empty_body() {
        let err = GcpError::from_api_response("redis", 404, "");
        assert_eq!(err.message, "HTTP 404");
        assert!(err.is_not_found());
    }

    #[test]
    fn operation_statuses() {
        let failed = GcpError::operation_failed("redis", 9, "quota exceeded");
        assert!(failed.is_operation_failed());
        assert_eq!(failed.code, 9);
        assert_eq!(failed.message, "quota exceeded");

        let timeout = GcpError::operation_timeout("run", "operations/abc", 600);
        assert!(timeout.is_operation_timeout());
        assert!(timeout.message.contains("operations/abc"));
    }

    #[test]
    fn serde_roundtrip() {
        let err = GcpError::already_exists("eventarc", "trigger exists");
        let json = serde_json::to_string(&err).unwrap();
        let back: GcpError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
