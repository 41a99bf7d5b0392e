//! Innermost service: runs the handler inside its transactional scope.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::Service;

use super::Invocation;
use crate::error::Failure;
use crate::handler::Reply;

/// Invokes the entry's handler through [`DynHandler::invoke_scoped`](crate::handler::DynHandler::invoke_scoped).
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionalService;

impl Service<Invocation> for TransactionalService {
    type Response = Reply;
    type Error = Failure;
    type Future = Pin<Box<dyn Future<Output = Result<Reply, Failure>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        Box::pin(async move {
            let Invocation {
                ctx,
                message,
                entry,
            } = inv;
            entry
                .handler()
                .invoke_scoped(&ctx, &message)
                .await
                .map_err(Failure::from)
        })
    }
}
