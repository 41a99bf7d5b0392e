//! Event bus: zero-to-many handlers per kind, fire-and-forget publishing.

use std::sync::Arc;

use conveyor_core::{Message, MessageKind};
use tokio_util::sync::CancellationToken;

use super::lifecycle::ShutdownHandle;
use super::queue::{Envelope, QueueSender};
use super::shared::BusCore;
use super::worker::DrainReport;
use crate::config::BusConfig;
use crate::error::DispatchError;
use crate::handler::{DynHandler, Handler};
use crate::report::Reporter;

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Delivers each published event to every handler subscribed to its kind.
///
/// Handler failures are recorded by the reporter and never reach the
/// publisher.
pub struct EventBus {
    core: BusCore,
}

impl EventBus {
    /// Creates an event bus reporting through `tracing`.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self::with_reporter(config, Reporter::tracing())
    }

    #[must_use]
    pub fn with_reporter(config: BusConfig, reporter: Reporter) -> Self {
        Self {
            core: BusCore::new("event", config, reporter),
        }
    }

    /// Subscribes `handler` to `kind`. Handlers of one kind are invoked in
    /// subscription order.
    pub fn subscribe<H: Handler>(&mut self, kind: impl Into<MessageKind>, handler: H) {
        self.subscribe_shared(kind, Arc::new(handler));
    }

    /// Subscribes an already shared handler, e.g. one projection listening
    /// to several kinds.
    pub fn subscribe_shared(
        &mut self,
        kind: impl Into<MessageKind>,
        handler: Arc<dyn DynHandler>,
    ) {
        self.core.registry.append(kind.into(), handler);
    }

    #[must_use]
    pub fn handler_count(&self, kind: &str) -> usize {
        self.core.registry.handler_count(kind)
    }

    #[must_use]
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            sender: self.core.sender(),
        }
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.core.shutdown_handle()
    }

    /// Runs the dispatch workers until `shutdown` fires, the shutdown handle
    /// is used, or every publisher has been dropped; then drains the queue
    /// within the configured grace period.
    pub async fn run(self, shutdown: CancellationToken) -> DrainReport {
        self.core.run(shutdown).await
    }
}

// ---------------------------------------------------------------------------
// EventPublisher
// ---------------------------------------------------------------------------

/// Cloneable producer handle for an [`EventBus`].
#[derive(Clone)]
pub struct EventPublisher {
    sender: QueueSender,
}

impl EventPublisher {
    /// Enqueues `message`, waiting while the queue is full. Returns as soon
    /// as the message is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::QueueClosed`] once shutdown has begun.
    pub async fn publish(&self, message: Message) -> Result<(), DispatchError> {
        self.sender.enqueue(Envelope::event(message)).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    use super::*;
    use crate::bus::BusState;
    use crate::config::InvocationMode;
    use crate::context::ExecutionContext;
    use crate::error::{FailureKind, HandlerError};
    use crate::handler::Reply;
    use crate::report::MemorySink;
    use crate::storage::{MemoryStore, MemoryTransaction};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Panic,
        Sleep(Duration),
        Hang,
    }

    /// Writes `<name>:<payload>` to its store and appends the same tag to
    /// `seen`, then behaves as told.
    struct Probe {
        name: &'static str,
        behaviour: Behaviour,
        store: MemoryStore<u32>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Probe {
        fn new(name: &'static str, behaviour: Behaviour) -> Self {
            Self {
                name,
                behaviour,
                store: MemoryStore::new(),
                seen: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Handler for Probe {
        type Store = MemoryStore<u32>;

        fn name(&self) -> &'static str {
            self.name
        }

        fn store(&self) -> &MemoryStore<u32> {
            &self.store
        }

        async fn handle(
            &self,
            _ctx: &ExecutionContext,
            tx: &mut MemoryTransaction<u32>,
            message: &Message,
        ) -> Result<Reply, HandlerError> {
            let tag = format!(
                "{}:{}",
                self.name,
                String::from_utf8_lossy(message.payload())
            );
            self.seen.lock().push(tag.clone());
            tx.put(tag, 1)?;
            match self.behaviour {
                Behaviour::Succeed => Ok(Reply::empty()),
                Behaviour::Fail => Err(HandlerError::Rejected("probe failure".into())),
                Behaviour::Panic => panic!("probe panic"),
                Behaviour::Sleep(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(Reply::empty())
                }
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    fn config() -> BusConfig {
        BusConfig {
            queue_capacity: 16,
            ..BusConfig::event_defaults()
        }
    }

    fn event(kind: &str, payload: &str) -> Message {
        Message::new(kind, Bytes::from(payload.to_string()))
    }

    #[tokio::test]
    async fn every_handler_runs_despite_sibling_failures() {
        let sink = Arc::new(MemorySink::new());
        let mut bus = EventBus::with_reporter(config(), Reporter::new(sink.clone()));
        let failing = Probe::new("failing", Behaviour::Fail);
        let panicking = Probe::new("panicking", Behaviour::Panic);
        let healthy = Probe::new("healthy", Behaviour::Succeed);
        let healthy_store = healthy.store.clone();
        let failing_store = failing.store.clone();
        bus.subscribe("user.email_changed", failing);
        bus.subscribe("user.email_changed", panicking);
        bus.subscribe("user.email_changed", healthy);
        assert_eq!(bus.handler_count("user.email_changed"), 3);

        let publisher = bus.publisher();
        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));

        publisher.publish(event("user.email_changed", "1")).await.unwrap();
        publisher.publish(event("user.email_changed", "2")).await.unwrap();
        handle.shutdown();
        let report = running.await.unwrap();

        assert!(report.drained);
        assert_eq!(healthy_store.get("healthy:1"), Some(1));
        assert_eq!(healthy_store.get("healthy:2"), Some(1));
        assert!(failing_store.is_empty());
        assert_eq!(failing_store.rollbacks(), 2);

        let records = sink.records();
        assert_eq!(records.len(), 6);
        let faults = records
            .iter()
            .filter(|r| r.failure == Some(FailureKind::Fault))
            .count();
        let store_failures = records
            .iter()
            .filter(|r| r.failure == Some(FailureKind::Store))
            .count();
        assert_eq!(faults, 2);
        assert_eq!(store_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sibling_times_out_while_fast_one_commits() {
        let sink = Arc::new(MemorySink::new());
        let mut bus = EventBus::with_reporter(
            BusConfig {
                handler_timeout: Duration::from_millis(100),
                ..config()
            },
            Reporter::new(sink.clone()),
        );
        let slow = Probe::new("slow", Behaviour::Sleep(Duration::from_millis(500)));
        let fast = Probe::new("fast", Behaviour::Succeed);
        let (slow_store, fast_store) = (slow.store.clone(), fast.store.clone());
        bus.subscribe("user.connected_with_google", slow);
        bus.subscribe("user.connected_with_google", fast);

        let publisher = bus.publisher();
        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));
        publisher
            .publish(event("user.connected_with_google", "g"))
            .await
            .unwrap();
        handle.shutdown();
        running.await.unwrap();

        assert_eq!(fast_store.get("fast:g"), Some(1));
        assert!(slow_store.is_empty());
        assert_eq!(slow_store.rollbacks(), 1);

        let records = sink.records();
        let slow_record = records.iter().find(|r| r.handler == Some("slow")).unwrap();
        assert_eq!(slow_record.failure, Some(FailureKind::Timeout));
        let fast_record = records.iter().find(|r| r.handler == Some("fast")).unwrap();
        assert!(!fast_record.is_error());
        assert!(fast_record.elapsed < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn never_returning_handler_times_out_and_loop_continues() {
        let sink = Arc::new(MemorySink::new());
        let mut bus = EventBus::with_reporter(
            BusConfig {
                handler_timeout: Duration::from_millis(50),
                ..config()
            },
            Reporter::new(sink.clone()),
        );
        let hanging = Probe::new("hanging", Behaviour::Hang);
        let hanging_store = hanging.store.clone();
        let next = Probe::new("next", Behaviour::Succeed);
        let next_store = next.store.clone();
        bus.subscribe("stuck", hanging);
        bus.subscribe("after", next);

        let publisher = bus.publisher();
        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));
        publisher.publish(event("stuck", "x")).await.unwrap();
        publisher.publish(event("after", "y")).await.unwrap();
        handle.shutdown();
        running.await.unwrap();

        assert!(hanging_store.is_empty());
        assert_eq!(next_store.get("next:y"), Some(1));
        assert_eq!(sink.for_kind("stuck")[0].failure, Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn sequential_mode_runs_in_registration_order() {
        let mut bus = EventBus::new(BusConfig {
            invocation_mode: InvocationMode::Sequential,
            ..config()
        });
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let mut probe = Probe::new(name, Behaviour::Succeed);
            probe.seen = Arc::clone(&order);
            bus.subscribe("k", probe);
        }
        let publisher = bus.publisher();
        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));
        publisher.publish(event("k", "m")).await.unwrap();
        handle.shutdown();
        running.await.unwrap();

        assert_eq!(*order.lock(), vec!["first:m", "second:m", "third:m"]);
    }

    #[tokio::test]
    async fn sequential_failures_do_not_skip_later_handlers() {
        let sink = Arc::new(MemorySink::new());
        let mut bus = EventBus::with_reporter(
            BusConfig {
                invocation_mode: InvocationMode::Sequential,
                ..config()
            },
            Reporter::new(sink.clone()),
        );
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stores = Vec::new();
        for (name, behaviour) in [
            ("failing", Behaviour::Fail),
            ("panicking", Behaviour::Panic),
            ("healthy", Behaviour::Succeed),
        ] {
            let mut probe = Probe::new(name, behaviour);
            probe.seen = Arc::clone(&order);
            stores.push(probe.store.clone());
            bus.subscribe("k", probe);
        }
        let publisher = bus.publisher();
        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));
        publisher.publish(event("k", "m")).await.unwrap();
        handle.shutdown();
        running.await.unwrap();

        assert_eq!(*order.lock(), vec!["failing:m", "panicking:m", "healthy:m"]);
        assert!(stores[0].is_empty());
        assert!(stores[1].is_empty());
        assert_eq!(stores[2].get("healthy:m"), Some(1));

        let failures: Vec<_> = sink.for_kind("k").iter().map(|r| r.failure).collect();
        assert_eq!(
            failures,
            vec![Some(FailureKind::Store), Some(FailureKind::Fault), None]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_pool_shares_the_queue_and_drains_everything() {
        let sink = Arc::new(MemorySink::new());
        let mut bus = EventBus::with_reporter(
            BusConfig {
                queue_capacity: 4,
                workers: 3,
                ..config()
            },
            Reporter::new(sink.clone()),
        );
        let probe = Probe::new("counter", Behaviour::Sleep(Duration::from_millis(2)));
        let store = probe.store.clone();
        bus.subscribe("tick", probe);

        let publisher = bus.publisher();
        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));
        for i in 0..30 {
            publisher.publish(event("tick", &i.to_string())).await.unwrap();
        }
        handle.shutdown();
        let report = running.await.unwrap();

        assert!(report.drained);
        assert_eq!(report.discarded, 0);
        assert_eq!(store.len(), 30);
        assert_eq!(store.commits(), 30);
        for i in 0..30 {
            assert_eq!(store.get(&format!("counter:{i}")), Some(1));
        }
        let records = sink.for_kind("tick");
        assert_eq!(records.len(), 30);
        assert!(records.iter().all(|r| !r.is_error()));
        assert_eq!(handle.state(), BusState::Stopped);
    }

    #[tokio::test]
    async fn event_without_handlers_is_dropped() {
        let sink = Arc::new(MemorySink::new());
        let bus = EventBus::with_reporter(config(), Reporter::new(sink.clone()));
        let publisher = bus.publisher();
        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));

        publisher.publish(event("nobody.listens", "")).await.unwrap();
        handle.shutdown();
        let report = running.await.unwrap();

        assert!(report.drained);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn double_shutdown_is_safe_and_closes_gate() {
        let mut bus = EventBus::new(config());
        bus.subscribe("k", Probe::new("p", Behaviour::Succeed));
        let publisher = bus.publisher();
        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));

        handle.shutdown();
        handle.shutdown();
        let err = publisher.publish(event("k", "late")).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::QueueClosed);

        running.await.unwrap();
        assert_eq!(handle.state(), BusState::Stopped);
        handle.shutdown();
        assert_eq!(handle.state(), BusState::Stopped);
    }

    #[tokio::test]
    async fn external_token_stops_the_bus() {
        let bus = EventBus::new(config());
        let _publisher = bus.publisher();
        let handle = bus.shutdown_handle();
        let token = CancellationToken::new();
        let running = tokio::spawn(bus.run(token.clone()));

        token.cancel();
        running.await.unwrap();
        assert_eq!(handle.state(), BusState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_blocks_publisher_until_workers_start() {
        let mut bus = EventBus::new(BusConfig {
            queue_capacity: 2,
            ..config()
        });
        let probe = Probe::new("p", Behaviour::Succeed);
        let store = probe.store.clone();
        bus.subscribe("k", probe);
        let publisher = bus.publisher();

        publisher.publish(event("k", "1")).await.unwrap();
        publisher.publish(event("k", "2")).await.unwrap();
        let third = publisher.publish(event("k", "3"));
        tokio::pin!(third);
        let waited = tokio::time::timeout(Duration::from_millis(100), &mut third).await;
        assert!(waited.is_err(), "third publish must block on a full queue");

        let handle = bus.shutdown_handle();
        let running = tokio::spawn(bus.run(CancellationToken::new()));
        third.await.unwrap();
        handle.shutdown();
        running.await.unwrap();

        assert_eq!(store.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_discards_remaining_messages() {
        let mut bus = EventBus::new(BusConfig {
            shutdown_grace: Duration::from_millis(50),
            handler_timeout: Duration::from_secs(1),
            ..config()
        });
        let probe = Probe::new("slow", Behaviour::Sleep(Duration::from_millis(100)));
        let store = probe.store.clone();
        bus.subscribe("k", probe);
        let publisher = bus.publisher();
        for n in 0..3 {
            publisher.publish(event("k", &n.to_string())).await.unwrap();
        }

        let handle = bus.shutdown_handle();
        handle.shutdown();
        let report = bus.run(CancellationToken::new()).await;

        assert!(!report.drained);
        assert_eq!(report.discarded, 2);
        // The in-flight invocation was allowed to finish.
        assert_eq!(store.get("slow:0"), Some(1));
        assert_eq!(store.len(), 1);
        assert_eq!(handle.state(), BusState::Stopped);
    }

    #[tokio::test]
    async fn run_ends_when_all_publishers_are_dropped() {
        let mut bus = EventBus::new(config());
        let probe = Probe::new("p", Behaviour::Succeed);
        let store = probe.store.clone();
        bus.subscribe("k", probe);
        let publisher = bus.publisher();
        publisher.publish(event("k", "only")).await.unwrap();
        drop(publisher);

        let report = bus.run(CancellationToken::new()).await;
        assert!(report.drained);
        assert_eq!(store.get("p:only"), Some(1));
    }

    fn fifo_run(count: usize) -> Vec<String> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let mut bus = EventBus::new(BusConfig {
                queue_capacity: 4,
                workers: 1,
                ..BusConfig::event_defaults()
            });
            let probe = Probe::new("recorder", Behaviour::Succeed);
            let seen = Arc::clone(&probe.seen);
            bus.subscribe("seq", probe);
            let publisher = bus.publisher();
            let handle = bus.shutdown_handle();
            let running = tokio::spawn(bus.run(CancellationToken::new()));

            for n in 0..count {
                publisher.publish(event("seq", &n.to_string())).await.unwrap();
            }
            handle.shutdown();
            running.await.unwrap();
            let seen = seen.lock().clone();
            seen
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn single_handler_sees_publish_order(count in 1usize..40) {
            let seen = fifo_run(count);
            let expected: Vec<String> = (0..count).map(|n| format!("recorder:{n}")).collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
