//! Queue processor: moves QUEUED jobs into the orchestrator.
//!
//! The processor is the only component that claims queued jobs. It wakes on
//! demand (enqueue, resume, a worker finishing) or on a poll interval, takes
//! the write gate, and starts jobs in priority order while capacity remains.

mod choose;
mod queue;

pub use queue::QueueProcessor;
