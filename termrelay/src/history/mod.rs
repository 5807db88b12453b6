//! Session output history: the append-only buffer and its broadcast hub.
//!
//! Everything a session's remote shell ever emitted lives here, as
//! immutable sequence-numbered chunks. The hub layers live fan-out on
//! top of the buffer with an atomic replay-then-live handoff for
//! late-joining observers.

mod buffer;
mod hub;

pub use buffer::{HistoryBuffer, OutputChunk};
pub use hub::{BroadcastHub, MonitorEvent, MonitorStream};
