//! Newswire: Staged News Processing Pipeline
//!
//! Four stages turn fetched content into commentary, each reading the table
//! its predecessor writes and writing its own:
//!
//! ```text
//! source -> ingest -> raw_articles -> parse -> parsed_articles
//!        -> categorize -> categorized_articles -> comment -> commentary_articles
//! ```
//!
//! # Core Concepts
//!
//! - **Store**: Append-only tables that double as the work queue; a stage's
//!   pending work is every upstream row without a downstream row
//! - **Claims**: Short leases so concurrent workers of one stage skip each
//!   other's rows
//! - **Ticks**: One claim, process, commit cycle; failures defer the record
//!   to a later tick instead of stopping the stage
//!
//! # Example
//!
//! ```
//! use newswire::{OpenStore, SqliteStore, Stage, StageWorker, TableQueue, ArticleParser};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(SqliteStore::open_in_memory().unwrap());
//! let queue = TableQueue::new(store.clone(), Stage::Parse, "parse-0");
//! let worker = StageWorker::new("parse-0", Arc::new(queue), Arc::new(ArticleParser::default()));
//! assert!(worker.tick().await.unwrap().is_idle());
//! # });
//! ```

pub mod article;
pub mod config;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod stage;
pub mod storage;
pub mod worker;

pub use article::{
    Article, ArticleId, CategorizedArticle, CommentaryArticle, FetchedItem, ParsedArticle, Payload,
    RawArticle, Stage, StageInput, UpstreamKey,
};
pub use config::{ConfigError, PipelineConfig};
pub use pipeline::Pipeline;
pub use queue::{DeferOutcome, QueueError, SourceQueue, TableQueue, WorkItem, WorkQueue};
pub use stage::{
    ArticleParser, Categorizer, CommentaryGenerator, Ingestor, ProcessError, Processor,
};
pub use storage::{ArticleStore, OpenStore, SqliteStore, StorageError, StorageResult};
pub use worker::{CancellationToken, Scheduler, StageWorker, TickReport, WorkerError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
