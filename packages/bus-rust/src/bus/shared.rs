//! State and run loop shared by the event bus and the command bus.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{Lifecycle, ShutdownHandle};
use super::queue::{self, Envelope, QueueSender};
use super::registry::Registry;
use super::worker::{self, Dispatcher, DrainReport};
use crate::config::BusConfig;
use crate::report::Reporter;
use crate::wrapper::build_invocation_pipeline;

pub(crate) struct BusCore {
    name: &'static str,
    config: BusConfig,
    pub(crate) registry: Registry,
    sender: QueueSender,
    rx: mpsc::Receiver<Envelope>,
    lifecycle: Arc<Lifecycle>,
    reporter: Reporter,
}

impl BusCore {
    pub(crate) fn new(name: &'static str, config: BusConfig, reporter: Reporter) -> Self {
        let lifecycle = Arc::new(Lifecycle::new());
        let (sender, rx) = queue::bounded(
            config.effective_queue_capacity(),
            Arc::clone(&lifecycle),
            reporter.clone(),
        );
        Self {
            name,
            config,
            registry: Registry::new(),
            sender,
            rx,
            lifecycle,
            reporter,
        }
    }

    pub(crate) fn sender(&self) -> QueueSender {
        self.sender.clone()
    }

    pub(crate) fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.name, Arc::clone(&self.lifecycle))
    }

    /// Consumes the core, runs the worker pool until shutdown and drains.
    pub(crate) async fn run(self, shutdown: CancellationToken) -> DrainReport {
        let Self {
            name,
            config,
            registry,
            sender,
            rx,
            lifecycle,
            reporter,
        } = self;
        // Only publisher handles keep the queue open from here on.
        drop(sender);

        let workers = config.effective_workers();
        let pipeline = build_invocation_pipeline(reporter.clone(), config.fault_policy);
        let dispatcher = Arc::new(Dispatcher {
            bus: name,
            registry,
            pipeline,
            reporter,
            mode: config.invocation_mode,
            budget: config.handler_timeout,
        });

        lifecycle.mark_running();
        tracing::info!(
            bus = name,
            workers,
            capacity = config.effective_queue_capacity(),
            kinds = dispatcher.registry.kinds().len(),
            "bus running"
        );

        let report = worker::run_pool(
            dispatcher,
            rx,
            workers,
            Arc::clone(&lifecycle),
            config.shutdown_grace,
            shutdown,
        )
        .await;

        lifecycle.mark_stopped();
        tracing::info!(
            bus = name,
            drained = report.drained,
            discarded = report.discarded,
            "bus stopped"
        );
        report
    }
}
