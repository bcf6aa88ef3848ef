//! Queue over a stage table: upstream rows without a downstream row

use super::traits::{DeferOutcome, QueueError, WorkItem, WorkQueue};
use crate::article::{ArticleId, Payload, Stage, StageInput, UpstreamKey};
use crate::stage::ProcessError;
use crate::storage::{ArticleStore, ClaimRequest};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub struct TableQueue {
    store: Arc<dyn ArticleStore>,
    stage: Stage,
    claim: ClaimRequest,
    max_attempts: u32,
}

impl TableQueue {
    /// Queue for `stage` (parse, categorize or comment) claiming as `worker_id`.
    pub fn new(store: Arc<dyn ArticleStore>, stage: Stage, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            stage,
            claim: ClaimRequest::new(worker_id),
            max_attempts: 5,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.claim = self.claim.with_lease(lease);
        self
    }

    /// Quarantine after this many failures; 0 retries forever.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.claim.worker_id
    }

    fn upstream_id(item: &WorkItem) -> Result<ArticleId, QueueError> {
        match &item.key {
            UpstreamKey::Article(id) => Ok(*id),
            UpstreamKey::Source(s) => Err(QueueError::Source(format!(
                "table queue given source key {}",
                s
            ))),
        }
    }
}

#[async_trait]
impl WorkQueue for TableQueue {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn claim(&self, limit: usize) -> Result<Vec<WorkItem>, QueueError> {
        let claimed = self
            .store
            .select_unprocessed(self.stage, limit, &self.claim)
            .await?;
        Ok(claimed
            .into_iter()
            .map(|c| WorkItem {
                stage: self.stage,
                key: UpstreamKey::Article(c.article.id()),
                input: StageInput::Stored(c.article),
                attempts: c.attempts,
            })
            .collect())
    }

    async fn commit(&self, item: &WorkItem, payload: &Payload) -> Result<bool, QueueError> {
        Ok(self.store.insert_if_absent(&item.key, payload).await?)
    }

    async fn defer(&self, item: &WorkItem, error: &ProcessError) -> Result<DeferOutcome, QueueError> {
        let record = self
            .store
            .record_failure(
                self.stage,
                Self::upstream_id(item)?,
                &self.claim.worker_id,
                &error.to_string(),
                self.max_attempts,
            )
            .await?;
        Ok(if record.quarantined {
            DeferOutcome::Quarantined { attempts: record.attempts }
        } else {
            DeferOutcome::Retry { attempts: record.attempts }
        })
    }

    async fn release(&self, items: &[WorkItem]) -> Result<(), QueueError> {
        let ids = items
            .iter()
            .map(Self::upstream_id)
            .collect::<Result<Vec<_>, _>>()?;
        if ids.is_empty() {
            return Ok(());
        }
        self.store
            .release_claims(self.stage, &self.claim.worker_id, &ids)
            .await?;
        Ok(())
    }

    async fn renew(&self, items: &[WorkItem]) -> Result<HashSet<UpstreamKey>, QueueError> {
        let ids = items
            .iter()
            .map(Self::upstream_id)
            .collect::<Result<Vec<_>, _>>()?;
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let held = self.store.renew_claims(self.stage, &ids, &self.claim).await?;
        Ok(held.into_iter().map(UpstreamKey::Article).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{OpenStore, SqliteStore};

    async fn store_with_raw(n: usize) -> Arc<dyn ArticleStore> {
        let store: Arc<dyn ArticleStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        for i in 0..n {
            store
                .insert_if_absent(
                    &UpstreamKey::Source(format!("src-{}", i)),
                    &Payload::Raw { payload: format!("# Story {}\n\nBody.", i) },
                )
                .await
                .unwrap();
        }
        store
    }

    fn parsed() -> Payload {
        Payload::Parsed { title: "t".into(), body: "b".into() }
    }

    #[tokio::test]
    async fn claim_returns_raw_rows_oldest_first() {
        let store = store_with_raw(3).await;
        let queue = TableQueue::new(store, Stage::Parse, "parse-1");
        let items = queue.claim(10).await.unwrap();
        let keys: Vec<_> = items.iter().map(|i| i.key.clone()).collect();
        assert_eq!(
            keys,
            vec![UpstreamKey::Article(1), UpstreamKey::Article(2), UpstreamKey::Article(3)]
        );
        assert!(items.iter().all(|i| i.attempts == 0 && i.stage == Stage::Parse));
    }

    #[tokio::test]
    async fn committed_items_are_not_claimed_again() {
        let store = store_with_raw(2).await;
        let queue = TableQueue::new(store, Stage::Parse, "parse-1");
        let items = queue.claim(1).await.unwrap();
        assert!(queue.commit(&items[0], &parsed()).await.unwrap());
        assert!(!queue.commit(&items[0], &parsed()).await.unwrap());

        let next = queue.claim(10).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].key, UpstreamKey::Article(2));
    }

    #[tokio::test]
    async fn other_workers_skip_claimed_items_until_released() {
        let store = store_with_raw(2).await;
        let a = TableQueue::new(store.clone(), Stage::Parse, "parse-a");
        let b = TableQueue::new(store, Stage::Parse, "parse-b");

        let mine = a.claim(1).await.unwrap();
        let theirs = b.claim(10).await.unwrap();
        assert_eq!(theirs.len(), 1);
        assert_ne!(mine[0].key, theirs[0].key);

        a.release(&mine).await.unwrap();
        let after = b.claim(10).await.unwrap();
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn defer_counts_attempts_then_quarantines() {
        let store = store_with_raw(1).await;
        let queue = TableQueue::new(store, Stage::Parse, "parse-1").with_max_attempts(2);
        let error = ProcessError::Malformed("bad".into());

        let item = queue.claim(1).await.unwrap().remove(0);
        assert_eq!(queue.defer(&item, &error).await.unwrap(), DeferOutcome::Retry { attempts: 1 });

        let item = queue.claim(1).await.unwrap().remove(0);
        assert_eq!(item.attempts, 1);
        assert_eq!(
            queue.defer(&item, &error).await.unwrap(),
            DeferOutcome::Quarantined { attempts: 2 }
        );
        assert!(queue.claim(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn renew_keeps_claims_alive_past_the_first_lease() {
        let store = store_with_raw(2).await;
        let a = TableQueue::new(store.clone(), Stage::Parse, "parse-a")
            .with_lease(Duration::from_millis(100));
        let b = TableQueue::new(store, Stage::Parse, "parse-b");

        let mine = a.claim(10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let held = a.renew(&mine).await.unwrap();
        assert_eq!(held.len(), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(b.claim(10).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(b.claim(10).await.unwrap().len(), 2);
        assert!(a.renew(&mine).await.unwrap().is_empty());
    }
}
