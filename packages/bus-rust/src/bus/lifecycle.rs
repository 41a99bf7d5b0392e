//! Bus lifecycle state and the shutdown handle.
//!
//! Uses `ArcSwap` for lock-free state transitions and a `CancellationToken`
//! as the acceptance gate: once it fires, publishers are rejected and the
//! workers switch to draining.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

/// Bus lifecycle state.
///
/// State machine: Idle -> Running -> Draining -> Stopped. A bus shut down
/// before it runs goes Idle -> Draining directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Configured, accepting messages into the queue, no workers yet.
    Idle,
    /// Workers are consuming the queue.
    Running,
    /// The gate is closed; queued messages are being drained.
    Draining,
    /// All workers have exited.
    Stopped,
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: ArcSwap<BusState>,
    closing: CancellationToken,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(BusState::Idle),
            closing: CancellationToken::new(),
        }
    }

    pub(crate) fn state(&self) -> BusState {
        **self.state.load()
    }

    /// Whether publishers may still enqueue.
    pub(crate) fn is_accepting(&self) -> bool {
        !self.closing.is_cancelled()
    }

    pub(crate) fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    pub(crate) fn mark_running(&self) {
        self.state.rcu(|s| match **s {
            BusState::Idle => Arc::new(BusState::Running),
            other => Arc::new(other),
        });
    }

    /// Closes the gate. Returns `true` for the call that actually began the
    /// shutdown.
    pub(crate) fn begin_shutdown(&self) -> bool {
        self.closing.cancel();
        let previous = self.state.rcu(|s| match **s {
            BusState::Idle | BusState::Running => Arc::new(BusState::Draining),
            other => Arc::new(other),
        });
        matches!(*previous, BusState::Idle | BusState::Running)
    }

    pub(crate) fn mark_stopped(&self) {
        self.closing.cancel();
        self.state.store(Arc::new(BusState::Stopped));
    }
}

// ---------------------------------------------------------------------------
// ShutdownHandle
// ---------------------------------------------------------------------------

/// Cloneable handle that stops a bus.
///
/// The handle outlives the bus value itself: `run` consumes the bus, so grab
/// the handle first.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    bus: &'static str,
    lifecycle: Arc<Lifecycle>,
}

impl ShutdownHandle {
    pub(crate) fn new(bus: &'static str, lifecycle: Arc<Lifecycle>) -> Self {
        Self { bus, lifecycle }
    }

    /// Closes the acceptance gate and starts draining. Idempotent.
    pub fn shutdown(&self) {
        if self.lifecycle.begin_shutdown() {
            tracing::info!(bus = self.bus, "shutdown requested");
        }
    }

    #[must_use]
    pub fn state(&self) -> BusState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        !self.lifecycle.is_accepting()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
