//! Fault containment for handler invocations.
//!
//! A panic inside a handler must never take down the worker that runs it.
//! [`ContainLayer`] catches the unwind at the boundary and, under
//! [`FaultPolicy::Contain`], turns it into [`Failure::Fault`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use tower::{Layer, Service};

use super::Invocation;
use crate::error::Failure;
use crate::handler::Reply;

/// What the wrapper does with a panic raised by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    /// Recover the panic and report it as a `Fault` failure.
    #[default]
    Contain,
    /// Resume unwinding after the inner future (and its transaction) is dropped.
    Propagate,
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "Unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// ContainLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct ContainLayer {
    policy: FaultPolicy,
}

impl ContainLayer {
    #[must_use]
    pub fn new(policy: FaultPolicy) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for ContainLayer {
    type Service = ContainService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ContainService {
            inner,
            policy: self.policy,
        }
    }
}

// ---------------------------------------------------------------------------
// ContainService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ContainService<S> {
    inner: S,
    policy: FaultPolicy,
}

impl<S> Service<Invocation> for ContainService<S>
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
        let policy = self.policy;
        let ctx = inv.ctx.clone();
        let fut = self.inner.call(inv);
        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => match policy {
                    FaultPolicy::Contain => {
                        ctx.cancel();
                        Err(Failure::Fault {
                            detail: panic_message(payload.as_ref()),
                        })
                    }
                    FaultPolicy::Propagate => std::panic::resume_unwind(payload),
                },
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
