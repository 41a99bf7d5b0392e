//! Pipeline composition: the wrapper layers around the transactional service.

use tower::ServiceBuilder;

use super::contain::{ContainLayer, ContainService, FaultPolicy};
use super::report::{ReportLayer, ReportService};
use super::timeout::{TimeoutLayer, TimeoutService};
use super::transaction::TransactionalService;
use crate::report::Reporter;

/// The concrete service stack every bus runs its invocations through.
pub type InvocationPipeline = ReportService<ContainService<TimeoutService<TransactionalService>>>;

/// Builds the invocation pipeline.
///
/// Layer order (outermost to innermost):
/// 1. `ReportLayer` -- span plus one dispatch record per invocation, so
///    timeouts and recovered faults are reported like any other failure
/// 2. `ContainLayer` -- recover panics according to `policy`
/// 3. `TimeoutLayer` -- enforce the context deadline
/// 4. `TransactionalService` -- run the handler inside its transaction
#[must_use]
pub fn build_invocation_pipeline(reporter: Reporter, policy: FaultPolicy) -> InvocationPipeline {
    ServiceBuilder::new()
        .layer(ReportLayer::new(reporter))
        .layer(ContainLayer::new(policy))
        .layer(TimeoutLayer)
        .service(TransactionalService)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
