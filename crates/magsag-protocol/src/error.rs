//! Error taxonomy for the gate.
//!
//! Every terminal outcome a caller may need to branch on has its own variant:
//! "forbidden by policy", "denied by a human" and "nobody responded in time"
//! are never collapsed into one another.

use thiserror::Error;

use crate::ids::TicketId;
use crate::ticket::TicketStatus;

/// Boxed error preserved as `source` when a backend failure propagates.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("permission forbidden by policy: {tool_name}")]
    PermissionForbidden { tool_name: String },
    #[error(
        "approval denied for ticket {ticket_id}: {}",
        .note.as_deref().unwrap_or("no note given")
    )]
    ApprovalDenied {
        ticket_id: TicketId,
        note: Option<String>,
    },
    #[error("approval timed out for ticket {ticket_id}")]
    ApprovalTimeout { ticket_id: TicketId },
    #[error("ticket {ticket_id} already resolved as {status}")]
    ApprovalAlreadyResolved {
        ticket_id: TicketId,
        status: TicketStatus,
    },
    #[error("ticket not found: {0}")]
    TicketNotFound(TicketId),
    #[error("rate limit exceeded for {key}, retry after {retry_after_ms}ms")]
    RateLimitExceeded { key: String, retry_after_ms: u64 },
    /// Only ever logged and emitted as an event; requests fail open.
    #[error("rate limiter unavailable: {0}")]
    RateLimiterUnavailable(String),
    #[error("rate limiter backend error for {key}")]
    RateLimiterBackend {
        key: String,
        #[source]
        source: BoxError,
    },
    #[error("invalid rate limit key: {0:?}")]
    InvalidRateLimitKey(String),
    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl GateError {
    /// Stable snake_case label, used in logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PermissionForbidden { .. } => "permission_forbidden",
            Self::ApprovalDenied { .. } => "approval_denied",
            Self::ApprovalTimeout { .. } => "approval_timeout",
            Self::ApprovalAlreadyResolved { .. } => "approval_already_resolved",
            Self::TicketNotFound(_) => "ticket_not_found",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::RateLimiterUnavailable(_) => "rate_limiter_unavailable",
            Self::RateLimiterBackend { .. } => "rate_limiter_backend",
            Self::InvalidRateLimitKey(_) => "invalid_rate_limit_key",
            Self::InvalidRateLimit(_) => "invalid_rate_limit",
            Self::InvalidPolicy(_) => "invalid_policy",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for GateError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for GateError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

/// Convenience result type for gate operations.
pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_message_carries_note() {
        let err = GateError::ApprovalDenied {
            ticket_id: TicketId::from_string("t-1"),
            note: Some("too risky".to_owned()),
        };
        assert_eq!(err.to_string(), "approval denied for ticket t-1: too risky");
        assert_eq!(err.kind(), "approval_denied");
    }

    #[test]
    fn backend_error_keeps_source() {
        use std::error::Error as _;

        let err = GateError::RateLimiterBackend {
            key: "key:abc".to_owned(),
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "bad key",
            )),
        };
        let source = err.source().expect("source is kept");
        assert!(source.downcast_ref::<std::io::Error>().is_some());
    }
}
