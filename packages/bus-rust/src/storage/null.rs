//! No-op [`Store`] implementation.
//!
//! [`NullStore`] hands out transactions that stage nothing and always commit.
//! Used by handlers that have no persistent side effects of their own, such
//! as notifiers or command handlers that only compute a reply.

use async_trait::async_trait;

use super::{Store, Transaction};
use crate::context::ExecutionContext;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

#[derive(Debug)]
pub struct NullTransaction;

#[async_trait]
impl Store for NullStore {
    type Tx = NullTransaction;

    async fn begin(&self, _ctx: &ExecutionContext) -> Result<NullTransaction, StoreError> {
        Ok(NullTransaction)
    }
}

#[async_trait]
impl Transaction for NullTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
