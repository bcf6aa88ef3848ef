//! Store and source fixtures

use async_trait::async_trait;
use newswire::stage::MemorySource;
use newswire::{FetchedItem, OpenStore, Payload, ProcessError, Processor, SqliteStore, Stage, StageInput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// An on-disk store that lives as long as its directory.
pub struct TempStore {
    pub dir: TempDir,
    pub path: PathBuf,
    pub store: Arc<SqliteStore>,
}

impl TempStore {
    /// A second connection to the same database file.
    pub fn reopen(&self) -> Arc<SqliteStore> {
        Arc::new(SqliteStore::open(&self.path).expect("reopen store"))
    }
}

pub fn temp_store() -> TempStore {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("newswire.db");
    let store = Arc::new(SqliteStore::open(&path).expect("open store"));
    TempStore { dir, path, store }
}

/// A markdown news story with a distinct title and body.
pub fn news_item(n: usize) -> FetchedItem {
    FetchedItem::new(
        format!("wire:{:04}", n),
        format!(
            "# Story {n}: markets move\n\nStocks and shares traded as story {n} broke.\n\nAnalysts watched the bank."
        ),
    )
}

pub fn seeded_source(count: usize) -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new());
    for n in 0..count {
        source.push(news_item(n));
    }
    source
}

/// Wraps a processor and fails a seeded-random share of calls.
pub struct FlakyProcessor {
    inner: Arc<dyn Processor>,
    failure_rate: f64,
    rng: Mutex<StdRng>,
    pub calls: AtomicUsize,
    pub failures: AtomicUsize,
}

impl FlakyProcessor {
    pub fn new(inner: Arc<dyn Processor>, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Processor for FlakyProcessor {
    fn id(&self) -> &str {
        "flaky"
    }

    fn stage(&self) -> Stage {
        self.inner.stage()
    }

    async fn process(&self, input: &StageInput) -> Result<Payload, ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = self.rng.lock().unwrap().gen_bool(self.failure_rate);
        if fail {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(ProcessError::Internal("injected failure".into()));
        }
        self.inner.process(input).await
    }
}
