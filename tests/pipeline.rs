//! End-to-end pipeline behavior against an on-disk store
//!
//! Covers the hand-off contract across all four stages: exactly one
//! downstream row per upstream row under concurrent workers, injected
//! failures, crashed workers and restarts.
//!
//! Run with: `cargo test --test pipeline -- --nocapture`

mod common;

use common::{assert_chain_invariants, rows, seeded_source, temp_store, FlakyProcessor};
use newswire::stage::ArticleParser;
use newswire::{
    Article, ArticleStore, Pipeline, PipelineConfig, Processor, Scheduler, Stage, StageWorker,
    TableQueue, TickReport, WorkQueue,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(10);

fn scheduler_for(pipeline: &Pipeline, workers_per_stage: usize) -> Scheduler {
    let mut scheduler = Scheduler::new();
    for stage in Stage::ALL {
        for n in 0..workers_per_stage {
            scheduler.add(pipeline.worker(stage, n), TICK);
        }
    }
    scheduler
}

async fn wait_for_rows(store: &dyn ArticleStore, stage: Stage, count: u64, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if store.stage_stats(stage).await.expect("stats").rows >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn run_until_commentary(pipeline: &Pipeline, workers: usize, count: u64) -> Vec<TickReport> {
    let scheduler = scheduler_for(pipeline, workers);
    let token = scheduler.token();
    let running = tokio::spawn(scheduler.run());

    let done = wait_for_rows(pipeline.store().as_ref(), Stage::Comment, count, Duration::from_secs(20)).await;
    token.cancel();
    let totals = running.await.expect("scheduler task").expect("scheduler run");
    assert!(done, "pipeline did not reach {} commentary rows", count);
    totals
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_chain_with_concurrent_workers() {
    let temp = temp_store();
    let pipeline = Pipeline::new(PipelineConfig::default(), temp.store.clone())
        .with_source(seeded_source(12));

    let totals = run_until_commentary(&pipeline, 2, 12).await;
    assert_eq!(totals.len(), 8);

    let store = temp.store.as_ref();
    assert_chain_invariants(store).await;
    for stage in Stage::ALL {
        assert_eq!(store.stage_stats(stage).await.unwrap().rows, 12, "{} rows", stage);
    }
    for row in rows(store, Stage::Categorize).await {
        match row {
            Article::Categorized(c) => assert_eq!(c.category, "business"),
            other => panic!("unexpected row {:?}", other),
        }
    }

    // Each stage committed every record exactly once across its workers.
    for stage in Stage::ALL {
        let committed: usize = totals
            .iter()
            .filter(|t| t.stage == stage)
            .map(|t| t.committed)
            .sum();
        assert_eq!(committed, 12, "{} commits", stage);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn injected_failures_are_retried_to_completion() {
    let temp = temp_store();
    let config = PipelineConfig::from_yaml(
        "stages:\n  parse:\n    max_attempts: 0\n  categorize:\n    max_attempts: 0\n  comment:\n    max_attempts: 0\n",
    )
    .unwrap();
    let base = Pipeline::new(config.clone(), temp.store.clone());

    let flaky: Vec<Arc<FlakyProcessor>> = [Stage::Parse, Stage::Categorize, Stage::Comment]
        .iter()
        .enumerate()
        .map(|(i, stage)| Arc::new(FlakyProcessor::new(base.processor(*stage), 0.3, 7 + i as u64)))
        .collect();

    let mut pipeline = Pipeline::new(config, temp.store.clone()).with_source(seeded_source(10));
    for processor in &flaky {
        pipeline = pipeline.with_processor(processor.clone() as Arc<dyn Processor>);
    }

    let totals = run_until_commentary(&pipeline, 1, 10).await;
    assert_chain_invariants(temp.store.as_ref()).await;

    let injected: usize = flaky.iter().map(|p| p.failures.load(Ordering::SeqCst)).sum();
    let deferred: usize = totals.iter().map(|t| t.deferred).sum();
    assert!(injected > 0, "seeded rng injected no failures");
    assert_eq!(deferred, injected);
    assert!(totals.iter().all(|t| t.quarantined == 0));
}

#[tokio::test]
async fn oldest_rows_are_claimed_first() {
    let temp = temp_store();
    let pipeline = Pipeline::new(PipelineConfig::default(), temp.store.clone())
        .with_source(seeded_source(5));
    let ingested = pipeline.worker(Stage::Ingest, 0).tick().await.unwrap();
    assert_eq!(ingested.committed, 5);

    let parser = pipeline.worker(Stage::Parse, 0).with_batch_limit(2);
    parser.tick().await.unwrap();

    let raw_ids: Vec<i64> = rows(temp.store.as_ref(), Stage::Ingest)
        .await
        .iter()
        .map(|r| r.id())
        .collect();
    let parsed_from: Vec<i64> = rows(temp.store.as_ref(), Stage::Parse)
        .await
        .iter()
        .filter_map(|r| r.upstream_id())
        .collect();
    assert_eq!(parsed_from, raw_ids[..2].to_vec());
}

#[tokio::test]
async fn repeated_fetches_are_not_reingested() {
    let temp = temp_store();
    let source = seeded_source(3);
    let pipeline = Pipeline::new(PipelineConfig::default(), temp.store.clone())
        .with_source(source.clone());

    let ingest = pipeline.worker(Stage::Ingest, 0);
    assert_eq!(ingest.tick().await.unwrap().committed, 3);
    assert!(ingest.tick().await.unwrap().is_idle());

    source.push(common::news_item(3));
    assert_eq!(ingest.tick().await.unwrap().committed, 1);
    assert_eq!(temp.store.stage_stats(Stage::Ingest).await.unwrap().rows, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_worker_claims_expire_and_are_resumed() {
    let temp = temp_store();
    let pipeline = Pipeline::new(PipelineConfig::default(), temp.store.clone())
        .with_source(seeded_source(5));
    pipeline.worker(Stage::Ingest, 0).tick().await.unwrap();

    // A worker claims three rows, then dies before committing any of them.
    let crashed = TableQueue::new(temp.store.clone(), Stage::Parse, "parse-crashed")
        .with_lease(Duration::from_millis(300));
    assert_eq!(crashed.claim(3).await.unwrap().len(), 3);
    drop(crashed);

    // A new process on the same database file.
    let reopened = temp.reopen();
    let survivor = StageWorker::new(
        "parse-survivor",
        Arc::new(TableQueue::new(reopened.clone(), Stage::Parse, "parse-survivor")),
        Arc::new(ArticleParser::default()),
    );

    let before_expiry = survivor.tick().await.unwrap();
    assert_eq!(before_expiry.committed, 2);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let after_expiry = survivor.tick().await.unwrap();
    assert_eq!(after_expiry.committed, 3);
    assert!(survivor.tick().await.unwrap().is_idle());

    assert_eq!(reopened.stage_stats(Stage::Parse).await.unwrap().rows, 5);
    assert_chain_invariants(reopened.as_ref()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_resumes_without_duplicates() {
    let temp = temp_store();
    let source = seeded_source(8);

    {
        let pipeline = Pipeline::new(PipelineConfig::default(), temp.store.clone())
            .with_source(source.clone());
        run_until_commentary(&pipeline, 1, 1).await;
    }

    let reopened = temp.reopen();
    let pipeline = Pipeline::new(PipelineConfig::default(), reopened.clone()).with_source(source);
    let totals = run_until_commentary(&pipeline, 2, 8).await;

    let ingested_again: usize = totals
        .iter()
        .filter(|t| t.stage == Stage::Ingest)
        .map(|t| t.committed)
        .sum();
    assert!(ingested_again < 8, "restart re-ingested everything");
    for stage in Stage::ALL {
        assert_eq!(reopened.stage_stats(stage).await.unwrap().rows, 8);
    }
    assert_chain_invariants(reopened.as_ref()).await;
}

#[tokio::test]
async fn quarantined_record_can_be_released() {
    let temp = temp_store();
    let config = PipelineConfig::from_yaml("stages:\n  parse:\n    max_attempts: 1\n").unwrap();
    let source = Arc::new(newswire::stage::MemorySource::new());
    source.push(newswire::FetchedItem::new("wire:empty", "# Headline only"));
    let pipeline = Pipeline::new(config, temp.store.clone()).with_source(source);

    pipeline.worker(Stage::Ingest, 0).tick().await.unwrap();
    let parser = pipeline.worker(Stage::Parse, 0);
    assert_eq!(parser.tick().await.unwrap().quarantined, 1);
    assert!(parser.tick().await.unwrap().is_idle());

    let quarantined = temp.store.quarantined(Stage::Parse).await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert!(quarantined[0].last_error.contains("no body text"));

    assert!(temp.store.release_quarantine(Stage::Parse, quarantined[0].upstream_id).await.unwrap());
    assert_eq!(parser.tick().await.unwrap().claimed, 1);
}
