//! Conveyor core: message envelope, message kinds, payload codecs and clock.

pub mod clock;
pub mod message;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use message::{Message, MessageKind, PayloadError, PayloadFormat, SUMMARY_LIMIT};
