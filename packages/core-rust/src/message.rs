//! Immutable message envelope shared by the command and event buses.
//!
//! A [`Message`] carries a [`MessageKind`], an opaque serialized payload, the
//! wall-clock time it was created at, and a correlation identifier that ties
//! every log record produced while handling it back to the originating request.
//!
//! The payload is reference-counted ([`Bytes`]), so cloning a message for each
//! handler never copies the payload. Handlers decode their own typed view with
//! [`Message::decode_json`] or [`Message::decode_msgpack`].

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{ClockSource, SystemClock};

/// Maximum number of payload bytes rendered by [`Message::payload_summary`].
pub const SUMMARY_LIMIT: usize = 128;

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// Identifier of a command or event type, e.g. `"user.email_changed"`.
///
/// Backed by `Arc<str>` so the registry, the queue and every log record can
/// hold the kind without reallocating it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageKind(Arc<str>);

impl MessageKind {
    /// Creates a kind from any string-like value.
    #[must_use]
    pub fn new(kind: impl AsRef<str>) -> Self {
        Self(Arc::from(kind.as_ref()))
    }

    /// Returns the kind as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl From<String> for MessageKind {
    fn from(kind: String) -> Self {
        Self(Arc::from(kind))
    }
}

impl Borrow<str> for MessageKind {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// PayloadError
// ---------------------------------------------------------------------------

/// Wire format of a payload, reported in codec errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    MsgPack,
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::MsgPack => f.write_str("msgpack"),
        }
    }
}

/// Errors from encoding or decoding a message payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("failed to encode {format} payload for {kind}: {reason}")]
    Encode {
        kind: MessageKind,
        format: PayloadFormat,
        reason: String,
    },
    #[error("failed to decode {format} payload of {kind}: {reason}")]
    Decode {
        kind: MessageKind,
        format: PayloadFormat,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A command or domain event travelling through a bus.
///
/// Immutable once constructed. The only builder-style method,
/// [`with_correlation_id`](Message::with_correlation_id), consumes the value,
/// so a message can never change after it has been handed to a bus.
#[derive(Debug, Clone)]
pub struct Message {
    kind: MessageKind,
    payload: Bytes,
    occurred_at: u64,
    correlation_id: Uuid,
}

impl Message {
    /// Creates a message stamped with the system clock and a fresh correlation id.
    #[must_use]
    pub fn new(kind: impl Into<MessageKind>, payload: impl Into<Bytes>) -> Self {
        Self::with_clock(kind, payload, &SystemClock)
    }

    /// Creates a message stamped with the given clock.
    #[must_use]
    pub fn with_clock(
        kind: impl Into<MessageKind>,
        payload: impl Into<Bytes>,
        clock: &dyn ClockSource,
    ) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
            occurred_at: clock.now(),
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Serializes `value` as JSON and wraps it in a message.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Encode`] if `value` cannot be serialized.
    pub fn json<T: Serialize>(kind: impl Into<MessageKind>, value: &T) -> Result<Self, PayloadError> {
        let kind = kind.into();
        match serde_json::to_vec(value) {
            Ok(bytes) => Ok(Self::new(kind, bytes)),
            Err(e) => Err(PayloadError::Encode {
                kind,
                format: PayloadFormat::Json,
                reason: e.to_string(),
            }),
        }
    }

    /// Serializes `value` as `MessagePack` (named fields) and wraps it in a message.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Encode`] if `value` cannot be serialized.
    pub fn msgpack<T: Serialize>(
        kind: impl Into<MessageKind>,
        value: &T,
    ) -> Result<Self, PayloadError> {
        let kind = kind.into();
        match rmp_serde::to_vec_named(value) {
            Ok(bytes) => Ok(Self::new(kind, bytes)),
            Err(e) => Err(PayloadError::Encode {
                kind,
                format: PayloadFormat::MsgPack,
                reason: e.to_string(),
            }),
        }
    }

    /// Replaces the generated correlation id, e.g. with the id of the request
    /// that produced this message.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    #[must_use]
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Milliseconds since Unix epoch at which the message was created.
    #[must_use]
    pub fn occurred_at(&self) -> u64 {
        self.occurred_at
    }

    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Decodes the payload as JSON into the handler's own view.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Decode`] if the payload does not match `T`.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_slice(&self.payload).map_err(|e| PayloadError::Decode {
            kind: self.kind.clone(),
            format: PayloadFormat::Json,
            reason: e.to_string(),
        })
    }

    /// Decodes the payload as `MessagePack` into the handler's own view.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Decode`] if the payload does not match `T`.
    pub fn decode_msgpack<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        rmp_serde::from_slice(&self.payload).map_err(|e| PayloadError::Decode {
            kind: self.kind.clone(),
            format: PayloadFormat::MsgPack,
            reason: e.to_string(),
        })
    }

    /// Renders at most [`SUMMARY_LIMIT`] payload bytes as lossy UTF-8 for logs.
    #[must_use]
    pub fn payload_summary(&self) -> String {
        if self.payload.len() <= SUMMARY_LIMIT {
            return String::from_utf8_lossy(&self.payload).into_owned();
        }
        let mut summary = String::from_utf8_lossy(&self.payload[..SUMMARY_LIMIT]).into_owned();
        summary.push_str(&format!("... ({} bytes)", self.payload.len()));
        summary
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
