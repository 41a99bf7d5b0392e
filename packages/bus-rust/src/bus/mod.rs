//! Command and event buses.
//!
//! - [`registry`]: kind -> ordered handler entries
//! - `queue`: bounded hand-off between publishers and workers
//! - [`worker`]: the dispatch loop and its shutdown drain
//! - [`lifecycle`]: bus state machine and [`ShutdownHandle`]
//! - [`event`] / [`command`]: the two bus flavours over one shared core

pub mod command;
pub mod event;
pub mod lifecycle;
pub(crate) mod queue;
pub mod registry;
mod shared;
pub mod worker;

pub use command::{CommandBus, CommandDispatcher};
pub use event::{EventBus, EventPublisher};
pub use lifecycle::{BusState, ShutdownHandle};
pub use registry::Registry;
pub use worker::DrainReport;
