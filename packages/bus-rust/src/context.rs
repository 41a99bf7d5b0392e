//! Per-invocation execution context.

use std::time::Duration;

use conveyor_core::{Message, MessageKind};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context created fresh for every (message, handler) pair.
///
/// Carries the invocation deadline and a cancellation token that fires when
/// the deadline elapses or the bus aborts the invocation. Handlers that do
/// long-running work should select on [`cancelled`](Self::cancelled).
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    message_kind: MessageKind,
    handler: &'static str,
    correlation_id: Uuid,
    started_at: Instant,
    deadline: Instant,
    budget: Duration,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    /// Creates a context for invoking `handler` on `message` within `budget`.
    #[must_use]
    pub fn new(message: &Message, handler: &'static str, budget: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            message_kind: message.kind().clone(),
            handler,
            correlation_id: message.correlation_id(),
            started_at,
            deadline: started_at + budget,
            budget,
            cancellation: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn message_kind(&self) -> &MessageKind {
        &self.message_kind
    }

    #[must_use]
    pub fn handler(&self) -> &'static str {
        self.handler
    }

    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time left before the deadline, zero once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the invocation has been cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    pub(crate) fn cancel(&self) {
        self.cancellation.cancel();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_follows_budget() {
        let msg = Message::new("user.email_changed", Bytes::new());
        let ctx = ExecutionContext::new(&msg, "projection", Duration::from_millis(100));

        assert_eq!(ctx.message_kind(), msg.kind());
        assert_eq!(ctx.correlation_id(), msg.correlation_id());
        assert_eq!(ctx.remaining(), Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(ctx.remaining(), Duration::ZERO);
        assert!(ctx.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn cancel_is_visible_to_clones() {
        let msg = Message::new("k", Bytes::new());
        let ctx = ExecutionContext::new(&msg, "h", Duration::from_secs(1));
        let observer = ctx.clone();

        assert!(!observer.is_cancelled());
        ctx.cancel();
        observer.cancelled().await;
        assert!(observer.is_cancelled());
    }
}
