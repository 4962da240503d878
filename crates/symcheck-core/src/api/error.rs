use reqwest::StatusCode;
use thiserror::Error;

use crate::auth::RefreshError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized ({status}): {message}")]
    AuthRejected { status: u16, message: String },

    #[error("Session expired: {0}")]
    RefreshFailed(#[from] RefreshError),

    #[error("Account no longer exists")]
    AccountNotFound,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// JSON fields the backend uses to carry a human-readable error
const MESSAGE_FIELDS: [&str; 4] = ["message", "error", "detail", "msg"];

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Pull a message out of a JSON error body, falling back to the raw text.
    pub fn message_from_body(body: &str) -> String {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(body) {
            for field in MESSAGE_FIELDS {
                if let Some(serde_json::Value::String(message)) = map.get(field) {
                    return Self::truncate_body(message);
                }
            }
        }
        Self::truncate_body(body.trim())
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = Self::message_from_body(body);
        match status.as_u16() {
            401 => ApiError::AuthRejected {
                status: status.as_u16(),
                message,
            },
            404 => ApiError::NotFound(message),
            code => ApiError::Status {
                status: code,
                message,
            },
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::AuthRejected { status, .. } | ApiError::Status { status, .. } => Some(*status),
            ApiError::NotFound(_) | ApiError::AccountNotFound => Some(404),
            ApiError::RefreshFailed(RefreshError::Rejected { status, .. }) => Some(*status),
            _ => None,
        }
    }

    /// Connectivity problems and server-side faults; the session survives these.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Status { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    /// Errors after which the stored credential is gone.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ApiError::RefreshFailed(_) | ApiError::AccountNotFound)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            ApiError::InvalidResponse(error.to_string())
        } else {
            ApiError::Network(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_maps_auth_failures() {
        let err = ApiError::from_status(StatusCode::UNAUTHORIZED, r#"{"msg": "Token has expired"}"#);
        match err {
            ApiError::AuthRejected { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Token has expired");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // 422 is only an auth failure inside the pipeline; here it is a plain status
        let err = ApiError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "Invalid age");
        assert!(matches!(err, ApiError::Status { status: 422, .. }));
    }

    #[test]
    fn test_from_status_other_codes() {
        assert!(matches!(
            ApiError::from_status(StatusCode::NOT_FOUND, r#"{"error": "User not found"}"#),
            ApiError::NotFound(ref m) if m == "User not found"
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_REQUEST, r#"{"message": "Email already registered"}"#),
            ApiError::Status { status: 400, ref message } if message == "Email already registered"
        ));
        assert!(ApiError::from_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!ApiError::from_status(StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[test]
    fn test_message_truncated() {
        let body = "x".repeat(MAX_ERROR_BODY_LENGTH + 20);
        let message = ApiError::message_from_body(&body);
        assert!(message.contains("truncated"));
        assert!(message.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
    }

    #[test]
    fn test_terminal_classification() {
        assert!(ApiError::AccountNotFound.is_terminal());
        assert!(ApiError::RefreshFailed(RefreshError::NoRefreshToken).is_terminal());
        assert!(!ApiError::Network("connection reset".into()).is_terminal());
        assert!(ApiError::Network("connection reset".into()).is_transient());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::from_status(StatusCode::UNAUTHORIZED, "").status(), Some(401));
        assert_eq!(ApiError::from_status(StatusCode::BAD_GATEWAY, "").status(), Some(502));
        assert_eq!(ApiError::AccountNotFound.status(), Some(404));
        let refresh = RefreshError::Rejected { status: 401, message: "Token has been revoked".into() };
        assert_eq!(ApiError::RefreshFailed(refresh).status(), Some(401));
        assert_eq!(ApiError::Network("timeout".into()).status(), None);
    }
}
