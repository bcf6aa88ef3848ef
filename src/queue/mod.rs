//! Work queues over the shared store
//!
//! The store tables double as queues: a stage's pending work is every
//! upstream row without a downstream row. `TableQueue` serves the parse,
//! categorize and comment stages; `SourceQueue` serves ingest.

mod source;
mod table;
mod traits;

pub use source::SourceQueue;
pub use table::TableQueue;
pub use traits::{DeferOutcome, QueueError, WorkItem, WorkQueue};
