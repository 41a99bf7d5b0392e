//! Outermost layer: instruments each invocation and reports its outcome.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::Invocation;
use crate::error::Failure;
use crate::handler::Reply;
use crate::report::Reporter;

// ---------------------------------------------------------------------------
// ReportLayer
// ---------------------------------------------------------------------------

/// Tower layer that runs each invocation inside a `handle` span and writes
/// exactly one dispatch record for it.
#[derive(Clone, Default)]
pub struct ReportLayer {
    reporter: Reporter,
}

impl ReportLayer {
    #[must_use]
    pub fn new(reporter: Reporter) -> Self {
        Self { reporter }
    }
}

impl<S> Layer<S> for ReportLayer {
    type Service = ReportService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ReportService {
            inner,
            reporter: self.reporter.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ReportService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ReportService<S> {
    inner: S,
    reporter: Reporter,
}

impl<S> Service<Invocation> for ReportService<S>
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
        let span = info_span!(
            "handle",
            kind = %inv.message.kind(),
            handler = inv.entry.name(),
            correlation_id = %inv.message.correlation_id(),
        );
        let ctx = inv.ctx.clone();
        let message = inv.message.clone();
        let reporter = self.reporter.clone();
        let fut = self.inner.call(inv);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                reporter.invocation(&ctx, &message, &result, start.elapsed());
                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
