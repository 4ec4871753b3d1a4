//! Error types module
//!
//! All client-side failures are unified under the `ClientError` enum. Each
//! variant maps to one class of the failure taxonomy: pre-flight validation,
//! transport, timeout, server-side, rate limiting, auth, conflict, and
//! user-initiated cancellation. Cancellation is a terminal outcome, not an
//! error class — callers must never count it as a failure.

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request ({status}): {body}")]
    BadRequest { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Cancelled")]
    Cancelled,
}

impl ClientError {
    /// Map an HTTP status plus raw body text to the matching error class.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => ClientError::Unauthorized(body),
            403 => ClientError::Forbidden(body),
            404 => ClientError::NotFound(body),
            409 => ClientError::Conflict(body),
            408 => ClientError::Timeout(body),
            429 => ClientError::RateLimited(body),
            400..=499 => ClientError::BadRequest { status, body },
            _ => ClientError::Server { status, body },
        }
    }

    /// Whether retrying the failed operation can reasonably succeed.
    ///
    /// Network failures, timeouts, 5xx, and 429 are retryable. Validation
    /// and 4xx-class errors are not; retrying would produce the same result.
    /// Cancellation is never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Network(_)
                | ClientError::Timeout(_)
                | ClientError::Server { .. }
                | ClientError::RateLimited(_)
        )
    }

    /// Machine-readable error code for logs and structured output.
    pub fn error_code(&self) -> &'static str {
        match self {
            ClientError::Validation(_) => "VALIDATION",
            ClientError::Network(_) => "NETWORK",
            ClientError::Timeout(_) => "TIMEOUT",
            ClientError::Server { .. } => "SERVER",
            ClientError::RateLimited(_) => "RATE_LIMITED",
            ClientError::Unauthorized(_) => "UNAUTHORIZED",
            ClientError::Forbidden(_) => "FORBIDDEN",
            ClientError::NotFound(_) => "NOT_FOUND",
            ClientError::Conflict(_) => "CONFLICT",
            ClientError::BadRequest { .. } => "BAD_REQUEST",
            ClientError::InvalidResponse(_) => "INVALID_RESPONSE",
            ClientError::Internal(_) => "INTERNAL",
            ClientError::Cancelled => "CANCELLED",
        }
    }

    /// Human-readable message telling the user what to do next.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Validation(msg) => msg.clone(),
            ClientError::Network(_) => {
                "Could not reach the server. Check your connection and retry.".to_string()
            }
            ClientError::Timeout(_) => "The request timed out. Retry in a moment.".to_string(),
            ClientError::Server { status, .. } => {
                format!("The server returned an error ({}). Retry in a moment.", status)
            }
            ClientError::RateLimited(_) => {
                "Too many requests. Wait a little before retrying.".to_string()
            }
            ClientError::Unauthorized(_) => {
                "Your session has expired. Please sign in again.".to_string()
            }
            ClientError::Forbidden(_) => {
                "You do not have permission to perform this action.".to_string()
            }
            ClientError::NotFound(_) => "The requested resource was not found.".to_string(),
            ClientError::Conflict(_) => {
                "The dataset changed since the dry run. Re-run the dry run and confirm again."
                    .to_string()
            }
            ClientError::BadRequest { body, .. } => {
                format!("The server rejected the request: {}", body)
            }
            ClientError::InvalidResponse(_) => {
                "The server returned an unexpected response.".to_string()
            }
            ClientError::Internal(msg) => format!("Internal error: {}", msg),
            ClientError::Cancelled => "Operation cancelled.".to_string(),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::InvalidResponse(format!("JSON parsing error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_status_maps_auth_classes() {
        assert!(matches!(
            ClientError::from_status(401, "nope".into()),
            ClientError::Unauthorized(_)
        ));
        assert!(matches!(
            ClientError::from_status(403, "nope".into()),
            ClientError::Forbidden(_)
        ));
        assert!(matches!(
            ClientError::from_status(404, "gone".into()),
            ClientError::NotFound(_)
        ));
        assert!(matches!(
            ClientError::from_status(409, "changed".into()),
            ClientError::Conflict(_)
        ));
    }

    #[test]
    fn from_status_maps_retryable_classes() {
        let err = ClientError::from_status(429, "slow down".into());
        assert!(err.is_retryable());

        let err = ClientError::from_status(500, "boom".into());
        assert!(err.is_retryable());

        let err = ClientError::from_status(503, "unavailable".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn four_xx_is_not_retryable() {
        assert!(!ClientError::from_status(400, "bad".into()).is_retryable());
        assert!(!ClientError::from_status(401, "bad".into()).is_retryable());
        assert!(!ClientError::from_status(422, "bad".into()).is_retryable());
    }

    #[test]
    fn cancellation_is_not_retryable() {
        assert!(!ClientError::Cancelled.is_retryable());
    }

    #[test]
    fn network_and_timeout_are_retryable() {
        assert!(ClientError::Network("reset".into()).is_retryable());
        assert!(ClientError::Timeout("deadline".into()).is_retryable());
    }

    #[test]
    fn user_messages_distinguish_failure_classes() {
        let forbidden = ClientError::Forbidden("x".into()).user_message();
        let not_found = ClientError::NotFound("x".into()).user_message();
        let conflict = ClientError::Conflict("x".into()).user_message();
        assert!(forbidden.contains("permission"));
        assert!(not_found.contains("not found"));
        assert!(conflict.contains("dry run"));
        assert_ne!(forbidden, not_found);
        assert_ne!(not_found, conflict);
    }
}
