//! Storage trait definitions

use crate::article::{Article, ArticleId, Payload, Stage, UpstreamKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("Postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("Stage mismatch: {0}")]
    StageMismatch(String),

    #[error("Upstream row not found: {stage} {id}")]
    MissingUpstream { stage: Stage, id: ArticleId },

    #[error("Unsupported backend: {0}")]
    Unsupported(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Who is claiming and for how long.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Identifier of the claiming worker
    pub worker_id: String,
    /// How long the claim holds before another worker may take the row
    pub lease: Duration,
}

impl ClaimRequest {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            lease: Duration::from_secs(300),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Expiry instant for a claim taken at `now`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::milliseconds(self.lease.as_millis().min(i64::MAX as u128) as i64)
    }
}

/// An upstream row handed out by `select_unprocessed`.
#[derive(Debug, Clone, PartialEq)]
pub struct Claimed {
    pub article: Article,
    /// Failed processing attempts recorded so far
    pub attempts: u32,
}

/// Failure bookkeeping for one upstream row at one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub stage: Stage,
    pub upstream_id: ArticleId,
    pub attempts: u32,
    pub last_error: String,
    pub last_failed_at: DateTime<Utc>,
    pub quarantined: bool,
}

/// Liveness figures for one stage table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStats {
    pub stage: Stage,
    /// Rows in the stage's own table
    pub rows: u64,
    /// Newest `created_at` in the stage's own table
    pub latest_created_at: Option<DateTime<Utc>>,
    /// Upstream rows without a downstream row that are not quarantined
    pub backlog: u64,
    /// Upstream rows without a downstream row that are quarantined
    pub quarantined: u64,
}

/// Trait for the shared article store.
///
/// The store is both the durable chain of stage tables and the queue the
/// stages hand work through. Implementations must be thread-safe
/// (Send + Sync) since every worker of every stage shares one store.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    // === Hand-off primitives ===

    /// Insert the downstream row for `upstream` unless one already exists.
    ///
    /// Atomic: backed by a uniqueness constraint on the reference column, so
    /// of two racing writers exactly one gets `true`. Any claim on the
    /// upstream row is released in the same transaction.
    async fn insert_if_absent(&self, upstream: &UpstreamKey, payload: &Payload)
        -> StorageResult<bool>;

    /// Claim up to `limit` upstream rows of `stage` that have no downstream row.
    ///
    /// Oldest upstream `created_at` first. Rows under a live claim held by
    /// another worker are skipped, as are quarantined rows. The returned rows
    /// are claimed for `claim.worker_id` until the lease expires.
    async fn select_unprocessed(
        &self,
        stage: Stage,
        limit: usize,
        claim: &ClaimRequest,
    ) -> StorageResult<Vec<Claimed>>;

    /// Drop claims held by `worker_id` on the given upstream rows.
    async fn release_claims(
        &self,
        stage: Stage,
        worker_id: &str,
        upstream_ids: &[ArticleId],
    ) -> StorageResult<()>;

    /// Push the lease of claims `claim.worker_id` still holds.
    ///
    /// Returns the subset of `upstream_ids` the worker still owns. A row
    /// missing from the result was taken over after the lease lapsed.
    async fn renew_claims(
        &self,
        stage: Stage,
        upstream_ids: &[ArticleId],
        claim: &ClaimRequest,
    ) -> StorageResult<HashSet<ArticleId>>;

    /// Count one more failed attempt and release `worker_id`'s claim.
    ///
    /// A claim another worker took over is left in place. Quarantines the
    /// row once `attempts >= max_attempts` (when non-zero).
    async fn record_failure(
        &self,
        stage: Stage,
        upstream_id: ArticleId,
        worker_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> StorageResult<FailureRecord>;

    /// Which of `source_ids` already have a raw article.
    async fn known_sources(&self, source_ids: &[String]) -> StorageResult<HashSet<String>>;

    // === Inspection ===

    /// Load one row of the given stage's table.
    async fn load_article(&self, stage: Stage, id: ArticleId) -> StorageResult<Option<Article>>;

    /// Rows of `stage` referencing `upstream_id` (at most one by construction).
    async fn find_by_upstream(
        &self,
        stage: Stage,
        upstream_id: ArticleId,
    ) -> StorageResult<Vec<Article>>;

    /// Rows of `stage` created after `since`, newest first.
    async fn list_articles(
        &self,
        stage: Stage,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StorageResult<Vec<Article>>;

    /// Quarantined upstream rows for `stage`.
    async fn quarantined(&self, stage: Stage) -> StorageResult<Vec<FailureRecord>>;

    /// Clear the failure record so the row becomes claimable again.
    async fn release_quarantine(&self, stage: Stage, upstream_id: ArticleId) -> StorageResult<bool>;

    async fn stage_stats(&self, stage: Stage) -> StorageResult<StageStats>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: ArticleStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
