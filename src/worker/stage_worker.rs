//! StageWorker: one claim, process, commit cycle per tick

use super::report::TickReport;
use super::WorkerError;
use crate::article::{Payload, Stage};
use crate::queue::{DeferOutcome, WorkItem, WorkQueue};
use crate::stage::{ProcessError, Processor};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{Id, JoinSet};

/// Drives one stage's processing function against its queue.
///
/// A tick claims up to `batch_limit` items, processes them with at most
/// `concurrency` in flight, and settles each one: commit on success, defer
/// on failure. Before each record after the first the claims on the rest of
/// the batch are renewed, so a batch may outlast a single lease. A store
/// error aborts the tick and releases unsettled claims; the items are
/// offered again on a later tick.
pub struct StageWorker {
    id: String,
    queue: Arc<dyn WorkQueue>,
    processor: Arc<dyn Processor>,
    batch_limit: usize,
    concurrency: usize,
    process_timeout: Duration,
}

type Outcome = (usize, Result<Payload, ProcessError>);

impl StageWorker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn WorkQueue>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            processor,
            batch_limit: 10,
            concurrency: 1,
            process_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stage(&self) -> Stage {
        self.queue.stage()
    }

    /// Run one claim, process, commit cycle.
    pub async fn tick(&self) -> Result<TickReport, WorkerError> {
        let started = Instant::now();
        let mut report = TickReport::new(self.stage(), &self.id);

        let items = self.queue.claim(self.batch_limit).await?;
        report.claimed = items.len();
        if items.is_empty() {
            tracing::debug!(worker = %self.id, "nothing to do");
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        let mut settled = vec![false; items.len()];
        let result = self.settle_all(&items, &mut settled, &mut report).await;
        report.elapsed = started.elapsed();

        if let Err(e) = result {
            let unsettled: Vec<WorkItem> = items
                .iter()
                .zip(&settled)
                .filter(|(_, done)| !**done)
                .map(|(item, _)| item.clone())
                .collect();
            if let Err(release_err) = self.queue.release(&unsettled).await {
                tracing::warn!(worker = %self.id, error = %release_err, "could not release claims");
            }
            tracing::error!(worker = %self.id, error = %e, "tick aborted");
            return Err(e);
        }

        tracing::info!(
            worker = %self.id,
            stage = %report.stage,
            claimed = report.claimed,
            committed = report.committed,
            duplicates = report.duplicates,
            deferred = report.deferred,
            quarantined = report.quarantined,
            lost = report.lost,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "tick complete"
        );
        Ok(report)
    }

    async fn settle_all(
        &self,
        items: &[WorkItem],
        settled: &mut [bool],
        report: &mut TickReport,
    ) -> Result<(), WorkerError> {
        let mut tasks: JoinSet<Outcome> = JoinSet::new();
        let mut task_index: HashMap<Id, usize> = HashMap::new();
        let mut next = 0;

        loop {
            if next > 0 && next < items.len() && tasks.len() < self.concurrency {
                if let Err(e) = self.renew_unsettled(items, settled, next, report).await {
                    tasks.abort_all();
                    return Err(e);
                }
            }
            while next < items.len() && tasks.len() < self.concurrency {
                if !settled[next] {
                    let handle = tasks.spawn(self.process_one(next, &items[next]));
                    task_index.insert(handle.id(), next);
                }
                next += 1;
            }

            let (idx, outcome) = match tasks.join_next_with_id().await {
                None => break,
                Some(Ok((_, outcome))) => outcome,
                Some(Err(join_err)) => {
                    let Some(&idx) = task_index.get(&join_err.id()) else {
                        return Err(join_err.into());
                    };
                    (idx, Err(ProcessError::Internal(format!("processor panicked: {}", join_err))))
                }
            };

            let step = self.settle(&items[idx], outcome, report).await;
            if let Err(e) = step {
                tasks.abort_all();
                return Err(e);
            }
            settled[idx] = true;
        }
        Ok(())
    }

    /// Extend the lease on every unsettled item before starting the next
    /// one. Items from `started` on that another worker took over are
    /// dropped from the batch unprocessed.
    async fn renew_unsettled(
        &self,
        items: &[WorkItem],
        settled: &mut [bool],
        started: usize,
        report: &mut TickReport,
    ) -> Result<(), WorkerError> {
        let pending: Vec<WorkItem> = items
            .iter()
            .zip(settled.iter())
            .filter(|(_, done)| !**done)
            .map(|(item, _)| item.clone())
            .collect();
        let held = self.queue.renew(&pending).await?;

        for idx in started..items.len() {
            if !settled[idx] && !held.contains(&items[idx].key) {
                settled[idx] = true;
                report.lost += 1;
                tracing::warn!(worker = %self.id, key = %items[idx].key, "claim taken over, skipping");
            }
        }
        Ok(())
    }

    fn process_one(
        &self,
        idx: usize,
        item: &WorkItem,
    ) -> impl std::future::Future<Output = Outcome> + Send + 'static {
        let processor = Arc::clone(&self.processor);
        let input = item.input.clone();
        let timeout = self.process_timeout;
        async move {
            let result = match tokio::time::timeout(timeout, processor.process(&input)).await {
                Ok(result) => result,
                Err(_) => Err(ProcessError::Timeout(timeout)),
            };
            (idx, result)
        }
    }

    async fn settle(
        &self,
        item: &WorkItem,
        outcome: Result<Payload, ProcessError>,
        report: &mut TickReport,
    ) -> Result<(), WorkerError> {
        match outcome {
            Ok(payload) if payload.stage() != item.stage => {
                let error = ProcessError::InvalidInput(format!(
                    "{} returned a {} payload",
                    self.processor.id(),
                    payload.stage()
                ));
                self.defer(item, &error, report).await
            }
            Ok(payload) => {
                if self.queue.commit(item, &payload).await? {
                    report.committed += 1;
                    tracing::debug!(worker = %self.id, key = %item.key, "committed");
                } else {
                    report.duplicates += 1;
                    tracing::debug!(worker = %self.id, key = %item.key, "already committed elsewhere");
                }
                Ok(())
            }
            Err(error) => self.defer(item, &error, report).await,
        }
    }

    async fn defer(
        &self,
        item: &WorkItem,
        error: &ProcessError,
        report: &mut TickReport,
    ) -> Result<(), WorkerError> {
        match self.queue.defer(item, error).await? {
            DeferOutcome::Quarantined { attempts } => {
                report.quarantined += 1;
                tracing::error!(
                    worker = %self.id,
                    key = %item.key,
                    attempts,
                    error = %error,
                    "record quarantined"
                );
            }
            DeferOutcome::Retry { attempts } => {
                report.deferred += 1;
                tracing::warn!(
                    worker = %self.id,
                    key = %item.key,
                    attempts,
                    error = %error,
                    "processing failed, will retry"
                );
            }
            DeferOutcome::Dropped => {
                report.deferred += 1;
                tracing::warn!(worker = %self.id, key = %item.key, error = %error, "processing failed");
            }
        }
        Ok(())
    }
}
