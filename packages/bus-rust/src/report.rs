//! Error/logging adapter: the single funnel for dispatch-loop outcomes.
//!
//! Every handler invocation produces exactly one [`DispatchRecord`], tagged
//! with the message kind, the correlation id and the elapsed processing time,
//! and classified by [`FailureKind`] when it failed. Records go to a
//! [`RecordSink`]; the default [`TracingSink`] turns them into structured
//! `tracing` events. The [`Reporter`] is terminal: it never returns errors and
//! survives a panicking sink.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use conveyor_core::{Message, MessageKind};
use parking_lot::Mutex;
use tracing::Level;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::{DispatchError, Failure, FailureKind};
use crate::handler::Reply;

// ---------------------------------------------------------------------------
// DispatchRecord
// ---------------------------------------------------------------------------

/// Structured log record written for every observed dispatch outcome.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub level: Level,
    pub correlation_id: Uuid,
    pub message_kind: MessageKind,
    /// `None` when no handler was involved (e.g. an unrouted command).
    pub handler: Option<&'static str>,
    pub message: &'static str,
    pub failure: Option<FailureKind>,
    pub error_detail: Option<String>,
    pub elapsed: Duration,
    pub payload_summary: String,
}

impl DispatchRecord {
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.failure.is_some()
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination for dispatch records.
pub trait RecordSink: Send + Sync {
    fn record(&self, record: &DispatchRecord);
}

/// Emits records as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl RecordSink for TracingSink {
    fn record(&self, record: &DispatchRecord) {
        let elapsed_ms = u64::try_from(record.elapsed.as_millis()).unwrap_or(u64::MAX);
        let handler = record.handler.unwrap_or("-");
        let failure = record.failure.map_or("none", FailureKind::as_str);
        let detail = record.error_detail.as_deref().unwrap_or("");

        if record.level == Level::ERROR {
            tracing::error!(
                correlation_id = %record.correlation_id,
                kind = %record.message_kind,
                handler,
                failure,
                error = detail,
                elapsed_ms,
                payload = %record.payload_summary,
                "{}", record.message
            );
        } else if record.level == Level::WARN {
            tracing::warn!(
                correlation_id = %record.correlation_id,
                kind = %record.message_kind,
                handler,
                failure,
                error = detail,
                elapsed_ms,
                payload = %record.payload_summary,
                "{}", record.message
            );
        } else {
            tracing::info!(
                correlation_id = %record.correlation_id,
                kind = %record.message_kind,
                handler,
                elapsed_ms,
                "{}", record.message
            );
        }
    }
}

/// Keeps records in memory for inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<DispatchRecord>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<DispatchRecord> {
        self.records.lock().clone()
    }

    /// Records written for messages of `kind`.
    #[must_use]
    pub fn for_kind(&self, kind: &str) -> Vec<DispatchRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.message_kind.as_str() == kind)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl RecordSink for MemorySink {
    fn record(&self, record: &DispatchRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Fans each record out to several sinks.
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl CompositeSink {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn RecordSink>>) -> Self {
        Self { sinks }
    }

    pub fn add(&mut self, sink: Arc<dyn RecordSink>) {
        self.sinks.push(sink);
    }
}

impl RecordSink for CompositeSink {
    fn record(&self, record: &DispatchRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

/// Classifies outcomes and writes them to the configured sink.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn RecordSink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink }
    }

    /// Reporter writing to a [`TracingSink`].
    #[must_use]
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink))
    }

    /// Log level used for a failure class.
    #[must_use]
    pub fn level_for(kind: FailureKind) -> Level {
        match kind {
            FailureKind::Deserialization | FailureKind::Timeout | FailureKind::QueueClosed => {
                Level::WARN
            }
            FailureKind::Store | FailureKind::Fault | FailureKind::Configuration => Level::ERROR,
        }
    }

    /// Records the outcome of one handler invocation.
    pub fn invocation(
        &self,
        ctx: &ExecutionContext,
        message: &Message,
        outcome: &Result<Reply, Failure>,
        elapsed: Duration,
    ) {
        let record = match outcome {
            Ok(_) => DispatchRecord {
                level: Level::INFO,
                correlation_id: ctx.correlation_id(),
                message_kind: ctx.message_kind().clone(),
                handler: Some(ctx.handler()),
                message: "handler completed",
                failure: None,
                error_detail: None,
                elapsed,
                payload_summary: message.payload_summary(),
            },
            Err(failure) => {
                let kind = failure.kind();
                DispatchRecord {
                    level: Self::level_for(kind),
                    correlation_id: ctx.correlation_id(),
                    message_kind: ctx.message_kind().clone(),
                    handler: Some(ctx.handler()),
                    message: "handler failed",
                    failure: Some(kind),
                    error_detail: Some(failure.to_string()),
                    elapsed,
                    payload_summary: message.payload_summary(),
                }
            }
        };
        self.emit(&record);
    }

    /// Records a message that never reached a handler: refused at the queue
    /// gate, or a command with no handler registered.
    pub fn undelivered(&self, message: &Message, error: &DispatchError) {
        let kind = error.kind();
        self.emit(&DispatchRecord {
            level: Self::level_for(kind),
            correlation_id: message.correlation_id(),
            message_kind: message.kind().clone(),
            handler: None,
            message: match error {
                DispatchError::Configuration { .. } => "message not routed",
                DispatchError::QueueClosed { .. } => "message rejected",
            },
            failure: Some(kind),
            error_detail: Some(error.to_string()),
            elapsed: Duration::ZERO,
            payload_summary: message.payload_summary(),
        });
    }

    fn emit(&self, record: &DispatchRecord) {
        if catch_unwind(AssertUnwindSafe(|| self.sink.record(record))).is_err() {
            tracing::error!(
                correlation_id = %record.correlation_id,
                kind = %record.message_kind,
                "record sink panicked, record dropped"
            );
        }
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::tracing()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
