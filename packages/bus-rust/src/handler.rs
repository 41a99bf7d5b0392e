//! Handler contract and its type-erased form stored in the registry.
//!
//! Domain code implements [`Handler`], naming the [`Store`] it writes to. The
//! registry keeps handlers as `Arc<dyn DynHandler>`; the blanket
//! implementation wraps every typed handler call in a transactional scope on
//! that store, so handlers only ever see an open transaction and never
//! manage commit or rollback themselves.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use conveyor_core::{Message, MessageKind};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::ExecutionContext;
use crate::error::HandlerError;
use crate::storage::{Store, Transaction};

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// Successful handler output.
///
/// Command handlers may attach a serialized payload for the waiting caller;
/// event handler replies are discarded by the bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    payload: Option<Bytes>,
}

impl Reply {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bytes(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: Some(payload.into()),
        }
    }

    /// Serializes `value` as the JSON reply payload.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Other`] if `value` cannot be serialized.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, HandlerError> {
        let bytes = serde_json::to_vec(value).map_err(anyhow::Error::from)?;
        Ok(Self::bytes(bytes))
    }

    #[must_use]
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Decodes the reply payload as JSON. An empty reply decodes as JSON `null`.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the payload does not match `T`.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.payload {
            Some(bytes) => serde_json::from_slice(bytes),
            None => serde_json::from_slice(b"null"),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// A message handler bound to the store its side effects go to.
///
/// The handler deserializes the payload itself and performs every state
/// change through `tx`. Returning `Ok` commits the transaction, returning
/// `Err` rolls it back.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Store: Store;

    /// Stable name used in log records.
    fn name(&self) -> &'static str;

    fn store(&self) -> &Self::Store;

    async fn handle(
        &self,
        ctx: &ExecutionContext,
        tx: &mut <Self::Store as Store>::Tx,
        message: &Message,
    ) -> Result<Reply, HandlerError>;
}

/// Object-safe form of [`Handler`] with the transactional scope built in.
#[async_trait]
pub trait DynHandler: Send + Sync {
    fn handler_name(&self) -> &'static str;

    /// Opens a transaction, runs the handler, then commits on success or rolls
    /// back on error. Dropping the returned future before completion drops
    /// the open transaction, which rolls it back.
    async fn invoke_scoped(
        &self,
        ctx: &ExecutionContext,
        message: &Message,
    ) -> Result<Reply, HandlerError>;
}

#[async_trait]
impl<H: Handler> DynHandler for H {
    fn handler_name(&self) -> &'static str {
        Handler::name(self)
    }

    async fn invoke_scoped(
        &self,
        ctx: &ExecutionContext,
        message: &Message,
    ) -> Result<Reply, HandlerError> {
        let mut tx = self.store().begin(ctx).await?;
        match self.handle(ctx, &mut tx, message).await {
            Ok(reply) => {
                tx.commit().await?;
                Ok(reply)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        kind = %message.kind(),
                        handler = Handler::name(self),
                        error = %rollback_err,
                        "rollback failed"
                    );
                }
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerEntry
// ---------------------------------------------------------------------------

/// One registration: a message kind and the handler subscribed to it.
#[derive(Clone)]
pub struct HandlerEntry {
    kind: MessageKind,
    handler: Arc<dyn DynHandler>,
}

impl HandlerEntry {
    pub fn new(kind: MessageKind, handler: Arc<dyn DynHandler>) -> Self {
        Self { kind, handler }
    }

    #[must_use]
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.handler.handler_name()
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<dyn DynHandler> {
        &self.handler
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("kind", &self.kind)
            .field("handler", &self.name())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
