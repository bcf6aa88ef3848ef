//! Stage workers and the scheduler that ticks them

mod cancel;
mod report;
mod scheduler;
mod stage_worker;

pub use cancel::CancellationToken;
pub use report::TickReport;
pub use scheduler::Scheduler;
pub use stage_worker::StageWorker;

use crate::queue::QueueError;
use thiserror::Error;

/// Errors that abort a tick or a scheduler run.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
