//! Handler execution wrapper.
//!
//! Every handler invocation goes through the same tower service stack,
//! outermost first:
//!
//! - [`report`]: times the invocation and hands the outcome to the [`Reporter`](crate::report::Reporter)
//! - [`contain`]: recovers panics according to the [`FaultPolicy`]
//! - [`timeout`]: enforces the context deadline and cancels on expiry
//! - [`transaction`]: runs the handler inside a transaction on its store
//! - [`pipeline`]: composes the layers for one bus
//!
//! Dropping the inner future (deadline expiry, recovered panic) drops the
//! open transaction, which rolls it back.

pub mod contain;
pub mod pipeline;
pub mod report;
pub mod timeout;
pub mod transaction;

use conveyor_core::Message;

use crate::context::ExecutionContext;
use crate::handler::HandlerEntry;

pub use contain::{ContainLayer, FaultPolicy};
pub use pipeline::{build_invocation_pipeline, InvocationPipeline};
pub use report::ReportLayer;
pub use timeout::TimeoutLayer;
pub use transaction::TransactionalService;

/// Request flowing through the wrapper: one handler applied to one message.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub ctx: ExecutionContext,
    pub message: Message,
    pub entry: HandlerEntry,
}

impl Invocation {
    /// Builds an invocation with a fresh context whose deadline is `budget` from now.
    #[must_use]
    pub fn new(message: Message, entry: HandlerEntry, budget: std::time::Duration) -> Self {
        let ctx = ExecutionContext::new(&message, entry.name(), budget);
        Self {
            ctx,
            message,
            entry,
        }
    }
}
