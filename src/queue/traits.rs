//! WorkQueue trait: the claim / commit / defer contract workers drive

use crate::article::{Payload, Stage, StageInput, UpstreamKey};
use crate::stage::ProcessError;
use crate::storage::StorageError;
use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;

/// Errors from queue operations. Unlike `ProcessError`, these abort the
/// current tick.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("source error: {0}")]
    Source(String),
}

/// One unit of claimed work.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// The stage that will process this item
    pub stage: Stage,
    /// Upstream identity the downstream row will reference
    pub key: UpstreamKey,
    pub input: StageInput,
    /// Failed attempts recorded before this claim
    pub attempts: u32,
}

/// What happened to a deferred item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferOutcome {
    /// Offered again on a later tick
    Retry { attempts: u32 },
    /// Excluded until released by an operator
    Quarantined { attempts: u32 },
    /// Not tracked; the source offers it again on its own
    Dropped,
}

/// The per-stage view of the shared store as a queue.
///
/// `claim` never returns an item whose downstream row exists, or one
/// another live worker holds. `commit` returns `false` when another worker
/// already wrote the downstream row; that is success, not an error.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    fn stage(&self) -> Stage;

    async fn claim(&self, limit: usize) -> Result<Vec<WorkItem>, QueueError>;

    async fn commit(&self, item: &WorkItem, payload: &Payload) -> Result<bool, QueueError>;

    async fn defer(&self, item: &WorkItem, error: &ProcessError) -> Result<DeferOutcome, QueueError>;

    /// Give back claimed items that will not be processed this tick.
    async fn release(&self, _items: &[WorkItem]) -> Result<(), QueueError> {
        Ok(())
    }

    /// Extend the claims on `items` and report which are still held.
    ///
    /// An item missing from the result was taken over by another worker
    /// after its lease lapsed and must not be processed.
    async fn renew(&self, items: &[WorkItem]) -> Result<HashSet<UpstreamKey>, QueueError> {
        Ok(items.iter().map(|item| item.key.clone()).collect())
    }
}
