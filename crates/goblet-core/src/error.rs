//! Engine error type.

use goblet_gcp::GcpError;
use thiserror::Error;

pub type GobletResult<T> = std::result::Result<T, GobletError>;

#[derive(Debug, Error)]
pub enum GobletError {
    /// Invalid registration or configuration.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A long-running operation outlived its deadline.
    #[error("operation timed out: {0}")]
    OperationTimeout(String),

    /// A long-running operation finished with an error payload.
    #[error("operation failed ({code}): {message}")]
    OperationFailed { code: u16, message: String },

    /// The dispatcher could not classify an incoming invocation.
    #[error("unknown event kind: {0}")]
    UnknownEventKind(String),

    /// Source build (e.g. `gcloud builds submit`) failed.
    #[error("build failed: {0}")]
    Build(String),

    /// Any other cloud API failure.
    #[error(transparent)]
    Api(GcpError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl GobletError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GobletError::Validation(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GobletError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, GobletError::AlreadyExists(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, GobletError::PermissionDenied(_))
    }
}

impl From<GcpError> for GobletError {
    fn from(e: GcpError) -> Self {
        if e.is_operation_failed() {
            return GobletError::OperationFailed {
                code: e.code,
                message: e.message,
            };
        }
        if e.is_operation_timeout() {
            return GobletError::OperationTimeout(e.message);
        }
        match e.code {
            404 => GobletError::NotFound(e.to_string()),
            409 => GobletError::AlreadyExists(e.to_string()),
            403 => GobletError::PermissionDenied(e.to_string()),
            _ => GobletError::Api(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_status() {
        let err: GobletError = GcpError::from_api_response("run", 409, "").into();
        assert!(err.is_already_exists());
        let err: GobletError = GcpError::from_api_response("run", 404, "").into();
        assert!(err.is_not_found());
        let err: GobletError = GcpError::from_api_response("run", 403, "").into();
        assert!(err.is_permission_denied());
        let err: GobletError = GcpError::from_api_response("run", 500, "").into();
        assert!(matches!(err, GobletError::Api(_)));
    }

    #[test]
    fn keeps_operation_error_verbatim() {
        let err: GobletError = GcpError::operation_failed("redis", 3, "bad tier").into();
        match err {
            GobletError::OperationFailed { code, message } => {
                assert_eq!(code, 3);
                assert_eq!(message, "bad tier");
            }
            other => panic!("unexpected {:?}", other),
        }
        let err: GobletError = GcpError::operation_timeout("run", "operations/x", 600).into();
        assert!(matches!(err, GobletError::OperationTimeout(_)));
    }
}
