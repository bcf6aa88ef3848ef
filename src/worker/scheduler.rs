//! Scheduler: one interval loop per stage worker

use super::cancel::CancellationToken;
use super::report::TickReport;
use super::stage_worker::StageWorker;
use super::WorkerError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

/// Runs every registered worker on its own interval until cancelled.
///
/// Loops are independent: a slow or failing stage never delays another.
/// A tick that overruns its interval delays the next tick rather than
/// bursting to catch up.
pub struct Scheduler {
    workers: Vec<(Arc<StageWorker>, Duration)>,
    token: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            token: CancellationToken::new(),
        }
    }

    pub fn add(&mut self, worker: StageWorker, interval: Duration) -> &mut Self {
        self.workers.push((Arc::new(worker), interval));
        self
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Token that stops every loop between ticks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run until the token is cancelled; returns per-worker totals.
    pub async fn run(self) -> Result<Vec<TickReport>, WorkerError> {
        let mut loops = JoinSet::new();
        for (worker, interval) in self.workers {
            tracing::info!(
                worker = worker.id(),
                stage = %worker.stage(),
                interval_ms = interval.as_millis() as u64,
                "starting worker loop"
            );
            loops.spawn(run_loop(worker, interval, self.token.clone()));
        }

        let mut totals = Vec::new();
        while let Some(joined) = loops.join_next().await {
            totals.push(joined?);
        }
        totals.sort_by(|a, b| (a.stage, &a.worker_id).cmp(&(b.stage, &b.worker_id)));
        tracing::info!(workers = totals.len(), "scheduler stopped");
        Ok(totals)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_loop(
    worker: Arc<StageWorker>,
    interval: Duration,
    token: CancellationToken,
) -> TickReport {
    let mut totals = TickReport::new(worker.stage(), worker.id());
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = timer.tick() => {}
        }
        // An aborted tick already released its claims; the next tick retries.
        match worker.tick().await {
            Ok(report) => totals.absorb(&report),
            Err(e) => tracing::error!(worker = worker.id(), error = %e, "tick failed"),
        }
    }
    tracing::info!(worker = worker.id(), "{}", totals);
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::{Payload, Stage, UpstreamKey};
    use crate::queue::TableQueue;
    use crate::stage::ArticleParser;
    use crate::storage::{ArticleStore, OpenStore, SqliteStore};

    #[tokio::test]
    async fn scheduler_drains_backlog_and_stops_on_cancel() {
        let store: Arc<dyn ArticleStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        for i in 0..5 {
            store
                .insert_if_absent(
                    &UpstreamKey::Source(format!("s{}", i)),
                    &Payload::Raw { payload: format!("# T{}\n\nbody", i) },
                )
                .await
                .unwrap();
        }

        let mut scheduler = Scheduler::new();
        for n in 0..2 {
            let id = format!("parse-{}", n);
            let queue = TableQueue::new(store.clone(), Stage::Parse, id.clone());
            scheduler.add(
                StageWorker::new(id, Arc::new(queue), Arc::new(ArticleParser::default()))
                    .with_batch_limit(2),
                Duration::from_millis(10),
            );
        }
        let token = scheduler.token();
        let running = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        let totals = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("scheduler stopped")
            .unwrap()
            .unwrap();

        assert_eq!(totals.len(), 2);
        let committed: usize = totals.iter().map(|t| t.committed).sum();
        assert_eq!(committed, 5);
        assert_eq!(store.stage_stats(Stage::Parse).await.unwrap().backlog, 0);
    }

    #[tokio::test]
    async fn empty_scheduler_returns_immediately() {
        let scheduler = Scheduler::new();
        assert!(scheduler.is_empty());
        assert!(scheduler.run().await.unwrap().is_empty());
    }
}
