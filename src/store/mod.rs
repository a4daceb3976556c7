/*!
 * Event Store
 * Producer-side buffering, the queues behind it, and the collector facade
 */

pub mod buffer;
mod collector;
pub mod queue;

pub use buffer::{BufferRegistry, Flush, HandOffError, LocalBuffer};
pub use collector::Collector;
pub use queue::{bounded, BatchReceiver, BatchSender, Poll};
