//! Bounded dispatch queue.
//!
//! A tokio mpsc channel is the single hand-off point between publishers and
//! workers. `send` waits while the channel is full, which is the bus's
//! backpressure. Every send races the shutdown gate so a publisher blocked on
//! a full queue is released with `QueueClosed` as soon as shutdown begins.

use std::sync::Arc;

use conveyor_core::Message;
use tokio::sync::{mpsc, oneshot};

use super::lifecycle::Lifecycle;
use crate::error::{CommandError, DispatchError};
use crate::handler::Reply;
use crate::report::Reporter;

/// Channel a command caller waits on for its handler's outcome.
pub(crate) type ReplySender = oneshot::Sender<Result<Reply, CommandError>>;

/// A queued message plus, for commands, the caller's reply channel.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) message: Message,
    pub(crate) reply: Option<ReplySender>,
}

impl Envelope {
    pub(crate) fn event(message: Message) -> Self {
        Self {
            message,
            reply: None,
        }
    }

    pub(crate) fn command(message: Message, reply: ReplySender) -> Self {
        Self {
            message,
            reply: Some(reply),
        }
    }

    /// Answers a waiting command caller with `QueueClosed`. No-op for events.
    pub(crate) fn reject(self) {
        if let Some(reply) = self.reply {
            let kind = self.message.kind().clone();
            let err = CommandError::from_dispatch(
                &DispatchError::QueueClosed { kind: kind.clone() },
                kind,
                self.message.correlation_id(),
            );
            // The caller may have stopped waiting.
            let _ = reply.send(Err(err));
        }
    }
}

/// Creates the bounded channel for one bus.
pub(crate) fn bounded(
    capacity: usize,
    lifecycle: Arc<Lifecycle>,
    reporter: Reporter,
) -> (QueueSender, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = QueueSender {
        tx,
        lifecycle,
        reporter,
    };
    (sender, rx)
}

// ---------------------------------------------------------------------------
// QueueSender
// ---------------------------------------------------------------------------

/// Producer side of the queue, shared by all publisher handles of a bus.
#[derive(Clone)]
pub(crate) struct QueueSender {
    tx: mpsc::Sender<Envelope>,
    lifecycle: Arc<Lifecycle>,
    reporter: Reporter,
}

impl QueueSender {
    /// Enqueues `envelope`, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::QueueClosed`] once shutdown has begun, or if
    /// the bus was dropped without running.
    pub(crate) async fn enqueue(&self, envelope: Envelope) -> Result<(), DispatchError> {
        let message = envelope.message.clone();
        let closing = self.lifecycle.closing();

        let accepted = if self.lifecycle.is_accepting() {
            tokio::select! {
                biased;
                () = closing.cancelled() => false,
                sent = self.tx.send(envelope) => sent.is_ok(),
            }
        } else {
            false
        };

        if accepted {
            return Ok(());
        }
        let err = DispatchError::QueueClosed {
            kind: message.kind().clone(),
        };
        self.reporter.undelivered(&message, &err);
        Err(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
