//! Command bus: exactly one handler per kind, outcome returned to the caller.

use std::sync::Arc;

use conveyor_core::{Message, MessageKind};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::lifecycle::ShutdownHandle;
use super::queue::{Envelope, QueueSender};
use super::shared::BusCore;
use super::worker::DrainReport;
use crate::config::BusConfig;
use crate::error::{CommandError, DispatchError};
use crate::handler::{DynHandler, Handler, Reply};
use crate::report::Reporter;

// ---------------------------------------------------------------------------
// CommandBus
// ---------------------------------------------------------------------------

/// Delivers each dispatched command to its single handler and hands the
/// handler's outcome back to the dispatching caller.
pub struct CommandBus {
    core: BusCore,
}

impl CommandBus {
    /// Creates a command bus reporting through `tracing`.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self::with_reporter(config, Reporter::tracing())
    }

    #[must_use]
    pub fn with_reporter(config: BusConfig, reporter: Reporter) -> Self {
        Self {
            core: BusCore::new("command", config, reporter),
        }
    }

    /// Registers the handler for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if `kind` already has a
    /// handler. Treat it as fatal at startup.
    pub fn subscribe<H: Handler>(
        &mut self,
        kind: impl Into<MessageKind>,
        handler: H,
    ) -> Result<(), DispatchError> {
        self.subscribe_shared(kind, Arc::new(handler))
    }

    /// Registers an already shared handler for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if `kind` already has a
    /// handler.
    pub fn subscribe_shared(
        &mut self,
        kind: impl Into<MessageKind>,
        handler: Arc<dyn DynHandler>,
    ) -> Result<(), DispatchError> {
        self.core.registry.insert_unique(kind.into(), handler)
    }

    #[must_use]
    pub fn handler_count(&self, kind: &str) -> usize {
        self.core.registry.handler_count(kind)
    }

    #[must_use]
    pub fn dispatcher(&self) -> CommandDispatcher {
        CommandDispatcher {
            sender: self.core.sender(),
        }
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.core.shutdown_handle()
    }

    /// Runs the dispatch workers until `shutdown` fires, the shutdown handle
    /// is used, or every dispatcher has been dropped; then drains the queue
    /// within the configured grace period.
    pub async fn run(self, shutdown: CancellationToken) -> DrainReport {
        self.core.run(shutdown).await
    }
}

// ---------------------------------------------------------------------------
// CommandDispatcher
// ---------------------------------------------------------------------------

/// Cloneable producer handle for a [`CommandBus`].
#[derive(Clone)]
pub struct CommandDispatcher {
    sender: QueueSender,
}

impl CommandDispatcher {
    /// Enqueues `message` and waits for its handler's outcome.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] classified as:
    /// - `QueueClosed` if shutdown began before the command was accepted, or
    ///   the bus stopped while it was still queued;
    /// - `Configuration` if no handler is registered for its kind;
    /// - the handler's failure class otherwise.
    pub async fn dispatch(&self, message: Message) -> Result<Reply, CommandError> {
        let kind = message.kind().clone();
        let correlation_id = message.correlation_id();
        let (reply_tx, reply_rx) = oneshot::channel();

        if let Err(err) = self
            .sender
            .enqueue(Envelope::command(message, reply_tx))
            .await
        {
            return Err(CommandError::from_dispatch(&err, kind, correlation_id));
        }

        match reply_rx.await {
            Ok(outcome) => outcome,
            // The envelope was dropped without an answer: the bus went away.
            Err(_) => Err(CommandError::from_dispatch(
                &DispatchError::QueueClosed { kind: kind.clone() },
                kind,
                correlation_id,
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::bus::BusState;
    use crate::context::ExecutionContext;
    use crate::error::{FailureKind, HandlerError};
    use crate::report::MemorySink;
    use crate::storage::{MemoryStore, MemoryTransaction};
    use crate::wrapper::FaultPolicy;

    #[derive(Debug, Serialize, Deserialize)]
    struct Rename {
        id: String,
        name: String,
    }

    /// Stores the new name and replies with the previous one.
    struct RenameHandler {
        store: MemoryStore<String>,
    }

    #[async_trait]
    impl Handler for RenameHandler {
        type Store = MemoryStore<String>;

        fn name(&self) -> &'static str {
            "rename"
        }

        fn store(&self) -> &MemoryStore<String> {
            &self.store
        }

        async fn handle(
            &self,
            _ctx: &ExecutionContext,
            tx: &mut MemoryTransaction<String>,
            message: &Message,
        ) -> Result<Reply, HandlerError> {
            let cmd: Rename = message.decode_json()?;
            if cmd.name == "boom" {
                panic!("rename exploded");
            }
            let slow = cmd.name == "slow";
            let previous = tx.get(&cmd.id);
            tx.put(cmd.id, cmd.name)?;
            if slow {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Reply::json(&previous)
        }
    }

    fn rename(id: &str, name: &str) -> Message {
        Message::json(
            "user.rename",
            &Rename {
                id: id.into(),
                name: name.into(),
            },
        )
        .unwrap()
    }

    fn bus_with(
        sink: &Arc<MemorySink>,
        policy: FaultPolicy,
    ) -> (CommandBus, MemoryStore<String>) {
        bus_from(
            sink,
            BusConfig {
                queue_capacity: 8,
                fault_policy: policy,
                ..BusConfig::command_defaults()
            },
        )
    }

    fn bus_from(sink: &Arc<MemorySink>, config: BusConfig) -> (CommandBus, MemoryStore<String>) {
        let store = MemoryStore::new();
        let mut bus = CommandBus::with_reporter(config, Reporter::new(sink.clone()));
        bus.subscribe(
            "user.rename",
            RenameHandler {
                store: store.clone(),
            },
        )
        .unwrap();
        (bus, store)
    }

    #[tokio::test]
    async fn dispatch_returns_handler_reply() {
        let sink = Arc::new(MemorySink::new());
        let (bus, store) = bus_with(&sink, FaultPolicy::Contain);
        let dispatcher = bus.dispatcher();
        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));

        let first = dispatcher.dispatch(rename("u1", "Ada")).await.unwrap();
        assert_eq!(first.decode_json::<Option<String>>().unwrap(), None);
        let second = dispatcher.dispatch(rename("u1", "Grace")).await.unwrap();
        assert_eq!(
            second.decode_json::<Option<String>>().unwrap().as_deref(),
            Some("Ada")
        );
        assert_eq!(store.get("u1").as_deref(), Some("Grace"));

        handle.shutdown();
        running.await.unwrap();
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_subscription_is_configuration_error() {
        let sink = Arc::new(MemorySink::new());
        let (mut bus, _store) = bus_with(&sink, FaultPolicy::Contain);
        let err = bus
            .subscribe(
                "user.rename",
                RenameHandler {
                    store: MemoryStore::new(),
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Configuration);
        assert_eq!(bus.handler_count("user.rename"), 1);
    }

    #[tokio::test]
    async fn unknown_kind_is_configuration_failure() {
        let sink = Arc::new(MemorySink::new());
        let (bus, _store) = bus_with(&sink, FaultPolicy::Contain);
        let dispatcher = bus.dispatcher();
        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));

        let msg = Message::new("user.delete", &b"{}"[..]);
        let id = msg.correlation_id();
        let err = dispatcher.dispatch(msg).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Configuration);
        assert_eq!(err.correlation_id, id);

        handle.shutdown();
        running.await.unwrap();
        let records = sink.for_kind("user.delete");
        assert_eq!(records.len(), 1);
        assert!(records[0].handler.is_none());
    }

    #[tokio::test]
    async fn handler_failures_are_classified_for_the_caller() {
        let sink = Arc::new(MemorySink::new());
        let (bus, store) = bus_with(&sink, FaultPolicy::Contain);
        store.poison_key("u2");
        let dispatcher = bus.dispatcher();
        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));

        let garbled = dispatcher
            .dispatch(Message::new("user.rename", &b"not json"[..]))
            .await
            .unwrap_err();
        assert_eq!(garbled.kind, FailureKind::Deserialization);

        let poisoned = dispatcher.dispatch(rename("u2", "Eve")).await.unwrap_err();
        assert_eq!(poisoned.kind, FailureKind::Store);

        let fault = dispatcher.dispatch(rename("u3", "boom")).await.unwrap_err();
        assert_eq!(fault.kind, FailureKind::Fault);
        assert!(fault.detail.contains("rename exploded"));

        // The loop is still serving commands.
        dispatcher.dispatch(rename("u4", "Bob")).await.unwrap();

        handle.shutdown();
        running.await.unwrap();
        assert!(store.get("u2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_and_rolls_back() {
        let sink = Arc::new(MemorySink::new());
        let (bus, store) = bus_from(
            &sink,
            BusConfig {
                queue_capacity: 8,
                handler_timeout: Duration::from_millis(50),
                ..BusConfig::command_defaults()
            },
        );
        let dispatcher = bus.dispatcher();
        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));

        let err = dispatcher.dispatch(rename("u1", "slow")).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Timeout);
        assert_eq!(err.message_kind.as_str(), "user.rename");
        assert!(store.is_empty());
        assert_eq!(store.rollbacks(), 1);
        assert_eq!(store.commits(), 0);

        // The worker moved on and still serves commands.
        dispatcher.dispatch(rename("u1", "Ada")).await.unwrap();

        handle.shutdown();
        running.await.unwrap();
        assert_eq!(store.get("u1").as_deref(), Some("Ada"));
        let records = sink.for_kind("user.rename");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].failure, Some(FailureKind::Timeout));
        assert_eq!(records[0].level, tracing::Level::WARN);
    }

    #[tokio::test]
    async fn propagated_panic_still_answers_the_caller() {
        let sink = Arc::new(MemorySink::new());
        let (bus, store) = bus_with(&sink, FaultPolicy::Propagate);
        let dispatcher = bus.dispatcher();
        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));

        let err = dispatcher.dispatch(rename("u1", "boom")).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Fault);
        dispatcher.dispatch(rename("u1", "Ada")).await.unwrap();

        handle.shutdown();
        running.await.unwrap();
        assert_eq!(store.get("u1").as_deref(), Some("Ada"));
        let faults = sink
            .records()
            .iter()
            .filter(|r| r.failure == Some(FailureKind::Fault))
            .count();
        assert_eq!(faults, 1);
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_is_queue_closed() {
        let sink = Arc::new(MemorySink::new());
        let (bus, _store) = bus_with(&sink, FaultPolicy::Contain);
        let dispatcher = bus.dispatcher();
        let handle = bus.shutdown_handle();
        handle.shutdown();

        let err = dispatcher.dispatch(rename("u1", "Ada")).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::QueueClosed);
        assert_eq!(handle.state(), BusState::Draining);
        bus.run(CancellationToken::new()).await;
        assert_eq!(handle.state(), BusState::Stopped);
    }

    #[tokio::test]
    async fn dropped_bus_answers_queued_command() {
        let sink = Arc::new(MemorySink::new());
        let (bus, _store) = bus_with(&sink, FaultPolicy::Contain);
        let dispatcher = bus.dispatcher();

        let pending = tokio::spawn(async move { dispatcher.dispatch(rename("u1", "Ada")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(bus);

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind, FailureKind::QueueClosed);
    }
}
