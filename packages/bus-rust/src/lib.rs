//! Conveyor bus: in-process command and event dispatch with bounded queues,
//! per-invocation deadlines, fault containment and transactional handlers.

pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod logging;
pub mod projection;
pub mod report;
pub mod storage;
pub mod wrapper;

pub use bus::{
    BusState, CommandBus, CommandDispatcher, DrainReport, EventBus, EventPublisher,
    ShutdownHandle,
};
pub use config::{BusConfig, DispatchArgs, DispatchConfig, InvocationMode};
pub use context::ExecutionContext;
pub use error::{CommandError, DispatchError, Failure, FailureKind, HandlerError, StoreError};
pub use handler::{DynHandler, Handler, HandlerEntry, Reply};
pub use report::{CompositeSink, DispatchRecord, MemorySink, RecordSink, Reporter, TracingSink};
pub use storage::{MemoryStore, NullStore, Store, Transaction};
pub use wrapper::FaultPolicy;
