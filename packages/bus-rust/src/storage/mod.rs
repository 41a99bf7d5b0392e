//! Transactional store contract consumed by message handlers.
//!
//! The execution wrapper opens a [`Transaction`] on the handler's [`Store`]
//! before the handler runs and closes it afterwards: committed when the
//! handler returns `Ok`, rolled back otherwise. A transaction that is dropped
//! without an explicit commit is rolled back, which covers every exit path
//! the wrapper cannot await on (deadline expiry, recovered panics, early
//! returns).

pub mod memory;
pub mod null;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::error::StoreError;

pub use memory::{MemoryStore, MemoryTransaction};
pub use null::{NullStore, NullTransaction};

/// Backing store a handler writes to.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Transaction handle bound to one invocation.
    type Tx: Transaction;

    /// Opens a transaction for the invocation described by `ctx`.
    async fn begin(&self, ctx: &ExecutionContext) -> Result<Self::Tx, StoreError>;
}

/// A unit of work against a [`Store`].
///
/// Implementations must discard all staged changes when dropped without
/// [`commit`](Transaction::commit).
#[async_trait]
pub trait Transaction: Send + 'static {
    /// Atomically applies all staged changes.
    async fn commit(self) -> Result<(), StoreError>;

    /// Discards all staged changes.
    async fn rollback(self) -> Result<(), StoreError>;
}
