//! Deadline enforcement for handler invocations.
//!
//! Fails invocations that outlive `ctx.deadline()` with `Failure::Timeout`,
//! cancelling the context and dropping the handler future.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use super::Invocation;
use crate::error::Failure;
use crate::handler::Reply;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps services with per-invocation deadline enforcement.
///
/// The deadline is read from each invocation's context, so budgets set per
/// bus need no state in the layer itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<Invocation> for TimeoutService<S>
where
    S: Service<Invocation, Response = Reply, Error = Failure> + Send,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = Failure;
    type Future = Pin<Box<dyn Future<Output = Result<Reply, Failure>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, inv: Invocation) -> Self::Future {
        let ctx = inv.ctx.clone();
        let fut = self.inner.call(inv);
        Box::pin(async move {
            // The handler future is dropped before the match, so an expired
            // invocation's transaction is already rolled back here.
            let outcome = tokio::time::timeout_at(ctx.deadline(), fut).await;
            match outcome {
                Ok(result) => result,
                Err(_elapsed) => {
                    ctx.cancel();
                    Err(Failure::Timeout {
                        budget: ctx.budget(),
                    })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
