//! Dispatch loop: a fixed pool of workers draining one bus queue.
//!
//! Each worker takes the next envelope, looks up its handlers and runs every
//! invocation through the wrapper pipeline in a task of its own, so not even
//! a propagated panic can end the worker. Shutdown is two-phase:
//!
//! 1. The gate closes; workers keep taking queued envelopes until the queue
//!    is empty.
//! 2. If that takes longer than the grace period, workers stop taking new
//!    envelopes, finish the invocations in flight (each bounded by its own
//!    deadline), and whatever is still queued is discarded.

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::Message;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::Instrument;

use super::lifecycle::Lifecycle;
use super::queue::{Envelope, ReplySender};
use super::registry::Registry;
use crate::config::InvocationMode;
use crate::context::ExecutionContext;
use crate::error::{CommandError, DispatchError, Failure};
use crate::handler::{HandlerEntry, Reply};
use crate::report::Reporter;
use crate::wrapper::contain::panic_message;
use crate::wrapper::{Invocation, InvocationPipeline};

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes one envelope to its handlers. Shared read-only by all workers.
pub(crate) struct Dispatcher {
    pub(crate) bus: &'static str,
    pub(crate) registry: Registry,
    pub(crate) pipeline: InvocationPipeline,
    pub(crate) reporter: Reporter,
    pub(crate) mode: InvocationMode,
    pub(crate) budget: Duration,
}

impl Dispatcher {
    pub(crate) async fn dispatch(&self, envelope: Envelope) {
        let Envelope { message, reply } = envelope;
        match reply {
            Some(reply) => self.dispatch_command(message, reply).await,
            None => self.dispatch_event(message).await,
        }
    }

    async fn dispatch_event(&self, message: Message) {
        let entries = self.registry.handlers_for(message.kind().as_str());
        if entries.is_empty() {
            tracing::debug!(
                bus = self.bus,
                kind = %message.kind(),
                correlation_id = %message.correlation_id(),
                "no handlers registered, event dropped"
            );
            return;
        }

        match self.mode {
            InvocationMode::Concurrent => {
                // Start every handler before awaiting any of them.
                let running: Vec<_> = entries
                    .iter()
                    .map(|entry| self.spawn_invocation(entry, &message))
                    .collect();
                for (ctx, task) in running {
                    let _ = self.settle(&ctx, &message, task).await;
                }
            }
            InvocationMode::Sequential => {
                for entry in entries {
                    let (ctx, task) = self.spawn_invocation(entry, &message);
                    let _ = self.settle(&ctx, &message, task).await;
                }
            }
        }
    }

    async fn dispatch_command(&self, message: Message, reply: ReplySender) {
        let kind = message.kind().clone();
        let correlation_id = message.correlation_id();

        let outcome = match self.registry.handlers_for(kind.as_str()).first() {
            Some(entry) => {
                let (ctx, task) = self.spawn_invocation(entry, &message);
                self.settle(&ctx, &message, task)
                    .await
                    .map_err(|failure| CommandError::from_failure(&failure, kind, correlation_id))
            }
            None => {
                let err = DispatchError::Configuration {
                    kind: kind.clone(),
                    reason: "no handler registered".to_string(),
                };
                self.reporter.undelivered(&message, &err);
                Err(CommandError::from_dispatch(&err, kind, correlation_id))
            }
        };

        if reply.send(outcome).is_err() {
            tracing::debug!(
                bus = self.bus,
                kind = %message.kind(),
                %correlation_id,
                "command caller stopped waiting, reply dropped"
            );
        }
    }

    fn spawn_invocation(
        &self,
        entry: &HandlerEntry,
        message: &Message,
    ) -> (ExecutionContext, JoinHandle<Result<Reply, Failure>>) {
        let invocation = Invocation::new(message.clone(), entry.clone(), self.budget);
        let ctx = invocation.ctx.clone();
        let task = tokio::spawn(self.pipeline.clone().oneshot(invocation));
        (ctx, task)
    }

    /// Waits for an invocation task. A task that panicked past the wrapper
    /// (propagating fault policy) is reported here as a fault.
    async fn settle(
        &self,
        ctx: &ExecutionContext,
        message: &Message,
        task: JoinHandle<Result<Reply, Failure>>,
    ) -> Result<Reply, Failure> {
        match task.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                let detail = if join_err.is_panic() {
                    panic_message(join_err.into_panic().as_ref())
                } else {
                    "invocation task cancelled".to_string()
                };
                tracing::error!(
                    bus = self.bus,
                    kind = %message.kind(),
                    handler = ctx.handler(),
                    correlation_id = %ctx.correlation_id(),
                    error = %detail,
                    "invocation task panicked"
                );
                let outcome = Err(Failure::Fault { detail });
                self.reporter.invocation(ctx, message, &outcome, ctx.elapsed());
                outcome
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// What happened to the queue when a bus stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Whether the queue emptied within the grace period.
    pub drained: bool,
    /// Messages still queued after the grace period, dropped undelivered.
    pub discarded: usize,
}

/// Queue consumer shared by the workers of one pool.
struct Source {
    rx: Mutex<mpsc::Receiver<Envelope>>,
    closing: CancellationToken,
    halt: CancellationToken,
}

impl Source {
    /// Next envelope to process, or `None` once the worker should exit.
    async fn next(&self) -> Option<Envelope> {
        let mut rx = self.rx.lock().await;
        if self.halt.is_cancelled() {
            return None;
        }
        if !self.closing.is_cancelled() {
            tokio::select! {
                biased;
                () = self.halt.cancelled() => return None,
                envelope = rx.recv() => return envelope,
                () = self.closing.cancelled() => {}
            }
        }
        // Draining: take what is queued, never wait for more.
        rx.try_recv().ok()
    }
}

/// Runs `workers` dispatch workers until shutdown, then drains the queue.
pub(crate) async fn run_pool(
    dispatcher: Arc<Dispatcher>,
    rx: mpsc::Receiver<Envelope>,
    workers: usize,
    lifecycle: Arc<Lifecycle>,
    grace: Duration,
    shutdown: CancellationToken,
) -> DrainReport {
    let bus = dispatcher.bus;
    let source = Arc::new(Source {
        rx: Mutex::new(rx),
        closing: lifecycle.closing().clone(),
        halt: CancellationToken::new(),
    });

    let mut pool = JoinSet::new();
    for id in 0..workers {
        let source = Arc::clone(&source);
        let dispatcher = Arc::clone(&dispatcher);
        pool.spawn(
            async move {
                while let Some(envelope) = source.next().await {
                    dispatcher.dispatch(envelope).await;
                }
            }
            .instrument(tracing::info_span!("worker", bus, id)),
        );
    }

    // Phase 0: run until shutdown is requested or every worker has exited
    // (all producers gone).
    tokio::select! {
        () = shutdown.cancelled() => {
            if lifecycle.begin_shutdown() {
                tracing::info!(bus, "shutdown requested");
            }
        }
        () = lifecycle.closing().cancelled() => {}
        () = join_all(&mut pool) => {}
    }

    // Phase 1: drain within the grace period.
    let drained = tokio::time::timeout(grace, join_all(&mut pool))
        .await
        .is_ok();

    // Phase 2: stop taking work, let in-flight invocations finish.
    if !drained {
        source.halt.cancel();
        join_all(&mut pool).await;
    }

    let mut rx = source.rx.lock().await;
    rx.close();
    let mut discarded = 0;
    while let Ok(envelope) = rx.try_recv() {
        envelope.reject();
        discarded += 1;
    }
    if discarded > 0 {
        tracing::warn!(
            bus,
            discarded,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "shutdown grace elapsed, undelivered messages discarded"
        );
    }

    DrainReport { drained, discarded }
}

async fn join_all(pool: &mut JoinSet<()>) {
    while let Some(joined) = pool.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "dispatch worker exited abnormally");
        }
    }
}
