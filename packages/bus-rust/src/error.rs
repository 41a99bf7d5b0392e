//! Failure taxonomy shared by the buses, the execution wrapper and the reporter.
//!
//! Layers, from innermost to outermost:
//!
//! - [`StoreError`] -- a handler's persistence operation failed.
//! - [`HandlerError`] -- what a handler returns.
//! - [`Failure`] -- the outcome of one wrapped invocation (handler error,
//!   deadline expiry or recovered fault).
//! - [`DispatchError`] -- bus-level errors seen by publishers and at startup.
//! - [`CommandError`] -- the classified outcome returned to command callers.
//!
//! Every failure maps onto one [`FailureKind`] for logging.

use std::fmt;
use std::time::Duration;

use conveyor_core::{MessageKind, PayloadError};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// FailureKind
// ---------------------------------------------------------------------------

/// Classification attached to every failure record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Invalid subscription setup, or a command with no handler.
    Configuration,
    /// Publish attempted after shutdown began.
    QueueClosed,
    /// The handler could not parse its expected payload shape.
    Deserialization,
    /// The handler's persistence operation failed.
    Store,
    /// The handler did not finish within its deadline.
    Timeout,
    /// A panic inside the handler was recovered at the wrapper boundary.
    Fault,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::QueueClosed => "queue_closed",
            Self::Deserialization => "deserialization",
            Self::Store => "store",
            Self::Timeout => "timeout",
            Self::Fault => "fault",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors raised by a transactional store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write to {key} rejected by store")]
    Rejected { key: String },
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("store error: {0}")]
    Other(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// Errors returned by message handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Deserialization(#[from] PayloadError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The handler refused the message on business grounds.
    #[error("rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Deserialization(_) => FailureKind::Deserialization,
            // A refused or otherwise failed handler could not apply its
            // change, which is a failure of its store-side operation.
            Self::Store(_) | Self::Rejected(_) | Self::Other(_) => FailureKind::Store,
        }
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// Outcome of a failed wrapped invocation.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("handler timed out after {}ms", .budget.as_millis())]
    Timeout { budget: Duration },
    #[error("handler panicked: {detail}")]
    Fault { detail: String },
}

impl Failure {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Handler(e) => e.kind(),
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Fault { .. } => FailureKind::Fault,
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Bus-level errors surfaced to publishers and at startup.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid subscription for {kind}: {reason}")]
    Configuration { kind: MessageKind, reason: String },
    #[error("bus is shutting down, {kind} not accepted")]
    QueueClosed { kind: MessageKind },
}

impl DispatchError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration { .. } => FailureKind::Configuration,
            Self::QueueClosed { .. } => FailureKind::QueueClosed,
        }
    }
}

// ---------------------------------------------------------------------------
// CommandError
// ---------------------------------------------------------------------------

/// Classified failure of a dispatched command, returned to the caller.
#[derive(Debug, Clone, thiserror::Error)]
#[error("command {message_kind} failed ({kind}): {detail}")]
pub struct CommandError {
    pub kind: FailureKind,
    pub message_kind: MessageKind,
    pub correlation_id: Uuid,
    pub detail: String,
}

impl CommandError {
    pub(crate) fn from_failure(
        failure: &Failure,
        message_kind: MessageKind,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            kind: failure.kind(),
            message_kind,
            correlation_id,
            detail: failure.to_string(),
        }
    }

    pub(crate) fn from_dispatch(
        error: &DispatchError,
        message_kind: MessageKind,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            kind: error.kind(),
            message_kind,
            correlation_id,
            detail: error.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use conveyor_core::{Message, PayloadFormat};

    use super::*;

    #[test]
    fn payload_errors_classify_as_deserialization() {
        let msg = Message::new("user.email_changed", &b"{"[..]);
        let err: HandlerError = msg.decode_json::<serde_json::Value>().unwrap_err().into();
        assert_eq!(err.kind(), FailureKind::Deserialization);
        assert!(matches!(
            err,
            HandlerError::Deserialization(PayloadError::Decode {
                format: PayloadFormat::Json,
                ..
            })
        ));
    }

    #[test]
    fn store_errors_classify_as_store() {
        let err: HandlerError = StoreError::Rejected { key: "u1".into() }.into();
        assert_eq!(err.kind(), FailureKind::Store);
        assert_eq!(Failure::from(err).kind(), FailureKind::Store);
    }

    #[test]
    fn timeout_and_fault_classification() {
        let timeout = Failure::Timeout {
            budget: Duration::from_millis(50),
        };
        assert_eq!(timeout.kind(), FailureKind::Timeout);
        assert_eq!(timeout.to_string(), "handler timed out after 50ms");

        let fault = Failure::Fault {
            detail: "boom".into(),
        };
        assert_eq!(fault.kind(), FailureKind::Fault);
    }

    #[test]
    fn command_error_carries_classification() {
        let failure = Failure::Fault {
            detail: "boom".into(),
        };
        let id = Uuid::new_v4();
        let err = CommandError::from_failure(&failure, MessageKind::from("user.rename"), id);
        assert_eq!(err.kind, FailureKind::Fault);
        assert_eq!(err.correlation_id, id);
        assert!(err.to_string().contains("user.rename"));
        assert!(err.to_string().contains("fault"));
    }

    #[test]
    fn dispatch_error_kinds() {
        let closed = DispatchError::QueueClosed {
            kind: MessageKind::from("k"),
        };
        assert_eq!(closed.kind(), FailureKind::QueueClosed);
        let config = DispatchError::Configuration {
            kind: MessageKind::from("k"),
            reason: "duplicate".into(),
        };
        assert_eq!(config.kind(), FailureKind::Configuration);
    }
}
