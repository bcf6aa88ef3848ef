//! Queue over an external source: items whose source id is not yet stored

use super::traits::{DeferOutcome, QueueError, WorkItem, WorkQueue};
use crate::article::{Payload, Stage, StageInput, UpstreamKey};
use crate::stage::{ProcessError, Source};
use crate::storage::ArticleStore;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// The ingest stage's queue.
///
/// There is no upstream table to claim from, so concurrent ingest workers
/// may fetch the same item; the uniqueness of `source_id` settles the race.
pub struct SourceQueue {
    store: Arc<dyn ArticleStore>,
    source: Arc<dyn Source>,
}

impl SourceQueue {
    pub fn new(store: Arc<dyn ArticleStore>, source: Arc<dyn Source>) -> Self {
        Self { store, source }
    }
}

#[async_trait]
impl WorkQueue for SourceQueue {
    fn stage(&self) -> Stage {
        Stage::Ingest
    }

    async fn claim(&self, limit: usize) -> Result<Vec<WorkItem>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let fetched = self
            .source
            .fetch()
            .await
            .map_err(|e| QueueError::Source(format!("{}: {}", self.source.id(), e)))?;

        let ids: Vec<String> = fetched.iter().map(|i| i.source_id.clone()).collect();
        let known = self.store.known_sources(&ids).await?;

        let mut seen = HashSet::new();
        Ok(fetched
            .into_iter()
            .filter(|item| !known.contains(&item.source_id))
            .filter(|item| seen.insert(item.source_id.clone()))
            .take(limit)
            .map(|item| WorkItem {
                stage: Stage::Ingest,
                key: UpstreamKey::Source(item.source_id.clone()),
                input: StageInput::Fetched(item),
                attempts: 0,
            })
            .collect())
    }

    async fn commit(&self, item: &WorkItem, payload: &Payload) -> Result<bool, QueueError> {
        Ok(self.store.insert_if_absent(&item.key, payload).await?)
    }

    async fn defer(&self, item: &WorkItem, error: &ProcessError) -> Result<DeferOutcome, QueueError> {
        tracing::debug!(key = %item.key, error = %error, "ingest item left at source");
        Ok(DeferOutcome::Dropped)
    }
}
