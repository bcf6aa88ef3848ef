//! PostgreSQL storage backend for newswire
//!
//! Same tables and contract as the SQLite backend. Claims take row locks
//! with `FOR UPDATE ... SKIP LOCKED`, so concurrent claimers never wait on
//! each other and never see the same row.

use super::traits::{
    ArticleStore, ClaimRequest, Claimed, FailureRecord, StageStats, StorageError, StorageResult,
};
use crate::article::{
    Article, ArticleId, CategorizedArticle, CommentaryArticle, ParsedArticle, Payload, RawArticle,
    Stage, UpstreamKey,
};
use crate::config::ConnectionConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashSet;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS raw_articles (
        id BIGSERIAL PRIMARY KEY,
        source_id TEXT NOT NULL UNIQUE,
        payload TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS parsed_articles (
        id BIGSERIAL PRIMARY KEY,
        raw_article_id BIGINT NOT NULL UNIQUE REFERENCES raw_articles(id),
        title TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS categorized_articles (
        id BIGSERIAL PRIMARY KEY,
        parsed_article_id BIGINT NOT NULL UNIQUE REFERENCES parsed_articles(id),
        category TEXT NOT NULL,
        confidence DOUBLE PRECISION NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS commentary_articles (
        id BIGSERIAL PRIMARY KEY,
        categorized_article_id BIGINT NOT NULL UNIQUE REFERENCES categorized_articles(id),
        content TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_raw_created ON raw_articles(created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_parsed_created ON parsed_articles(created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_categorized_created ON categorized_articles(created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_commentary_created ON commentary_articles(created_at, id)",
    r#"CREATE TABLE IF NOT EXISTS claims (
        stage TEXT NOT NULL,
        upstream_id BIGINT NOT NULL,
        worker_id TEXT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (stage, upstream_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS failures (
        stage TEXT NOT NULL,
        upstream_id BIGINT NOT NULL,
        attempts INTEGER NOT NULL,
        last_error TEXT NOT NULL,
        last_failed_at TIMESTAMPTZ NOT NULL,
        quarantined BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (stage, upstream_id)
    )"#,
];

/// Longest failure message kept in the failures table.
const MAX_ERROR_LEN: usize = 2000;

/// PostgreSQL-backed article store over a connection pool.
pub struct PgStore {
    pool: PgPool,
}

fn select_columns(stage: Stage, alias: &str) -> String {
    stage
        .columns()
        .iter()
        .map(|c| format!("{}.{}", alias, c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_article(stage: Stage, row: &PgRow) -> Result<Article, sqlx::Error> {
    Ok(match stage {
        Stage::Ingest => Article::Raw(RawArticle {
            id: row.try_get("id")?,
            source_id: row.try_get("source_id")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        }),
        Stage::Parse => Article::Parsed(ParsedArticle {
            id: row.try_get("id")?,
            raw_article_id: row.try_get("raw_article_id")?,
            title: row.try_get("title")?,
            body: row.try_get("body")?,
            created_at: row.try_get("created_at")?,
        }),
        Stage::Categorize => Article::Categorized(CategorizedArticle {
            id: row.try_get("id")?,
            parsed_article_id: row.try_get("parsed_article_id")?,
            category: row.try_get("category")?,
            confidence: row.try_get("confidence")?,
            created_at: row.try_get("created_at")?,
        }),
        Stage::Comment => Article::Commentary(CommentaryArticle {
            id: row.try_get("id")?,
            categorized_article_id: row.try_get("categorized_article_id")?,
            content: row.try_get("content")?,
            created_at: row.try_get("created_at")?,
        }),
    })
}

fn mismatch(upstream: &UpstreamKey, payload: &Payload) -> StorageError {
    StorageError::StageMismatch(format!(
        "{} payload cannot be keyed by {}",
        payload.stage(),
        upstream
    ))
}

fn reads_source(stage: Stage) -> StorageError {
    StorageError::StageMismatch(format!("stage {} reads an external source, not a table", stage))
}

impl PgStore {
    /// Connect with the resolved connection settings and create the schema.
    pub async fn connect(config: &ConnectionConfig) -> StorageResult<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StorageResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ArticleStore for PgStore {
    async fn insert_if_absent(
        &self,
        upstream: &UpstreamKey,
        payload: &Payload,
    ) -> StorageResult<bool> {
        let stage = payload.stage();
        let now = Utc::now();

        match upstream {
            UpstreamKey::Source(source_id) => {
                let Payload::Raw { payload: body } = payload else {
                    return Err(mismatch(upstream, payload));
                };
                let result = sqlx::query(
                    r#"
                    INSERT INTO raw_articles (source_id, payload, created_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (source_id) DO NOTHING
                    "#,
                )
                .bind(source_id)
                .bind(body)
                .bind(now)
                .execute(&self.pool)
                .await?;
                Ok(result.rows_affected() == 1)
            }
            UpstreamKey::Article(upstream_id) => {
                let Some(upstream_stage) = stage.upstream() else {
                    return Err(mismatch(upstream, payload));
                };
                let mut tx = self.pool.begin().await?;

                let upstream_created: Option<DateTime<Utc>> = sqlx::query_scalar(&format!(
                    "SELECT created_at FROM {} WHERE id = $1",
                    upstream_stage.downstream_table()
                ))
                .bind(upstream_id)
                .fetch_optional(&mut *tx)
                .await?;
                let Some(upstream_created) = upstream_created else {
                    return Err(StorageError::MissingUpstream {
                        stage: upstream_stage,
                        id: *upstream_id,
                    });
                };
                // Strictly after the upstream row, even at clock resolution limits
                let created_at = now.max(upstream_created + chrono::Duration::microseconds(1));

                let query = match payload {
                    Payload::Parsed { title, body } => sqlx::query(
                        r#"
                        INSERT INTO parsed_articles (raw_article_id, title, body, created_at)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (raw_article_id) DO NOTHING
                        "#,
                    )
                    .bind(upstream_id)
                    .bind(title)
                    .bind(body)
                    .bind(created_at),
                    Payload::Categorized { category, confidence } => sqlx::query(
                        r#"
                        INSERT INTO categorized_articles (parsed_article_id, category, confidence, created_at)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (parsed_article_id) DO NOTHING
                        "#,
                    )
                    .bind(upstream_id)
                    .bind(category)
                    .bind(confidence)
                    .bind(created_at),
                    Payload::Commentary { content } => sqlx::query(
                        r#"
                        INSERT INTO commentary_articles (categorized_article_id, content, created_at)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (categorized_article_id) DO NOTHING
                        "#,
                    )
                    .bind(upstream_id)
                    .bind(content)
                    .bind(created_at),
                    Payload::Raw { .. } => return Err(mismatch(upstream, payload)),
                };
                let inserted = query.execute(&mut *tx).await?.rows_affected() == 1;

                sqlx::query("DELETE FROM claims WHERE stage = $1 AND upstream_id = $2")
                    .bind(stage.as_str())
                    .bind(upstream_id)
                    .execute(&mut *tx)
                    .await?;

                tx.commit().await?;
                Ok(inserted)
            }
        }
    }

    async fn select_unprocessed(
        &self,
        stage: Stage,
        limit: usize,
        claim: &ClaimRequest,
    ) -> StorageResult<Vec<Claimed>> {
        let upstream = stage.upstream().ok_or_else(|| reads_source(stage))?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            SELECT {cols}, COALESCE(f.attempts, 0) AS attempts
            FROM {up} u
            LEFT JOIN claims c ON c.stage = $1 AND c.upstream_id = u.id
            LEFT JOIN failures f ON f.stage = $1 AND f.upstream_id = u.id
            WHERE NOT EXISTS (SELECT 1 FROM {down} d WHERE d.{fk} = u.id)
              AND (c.upstream_id IS NULL OR c.expires_at <= $2 OR c.worker_id = $3)
              AND (f.quarantined IS NULL OR NOT f.quarantined)
            ORDER BY u.created_at ASC, u.id ASC
            LIMIT $4
            FOR UPDATE OF u SKIP LOCKED
            "#,
            cols = select_columns(upstream, "u"),
            up = upstream.downstream_table(),
            down = stage.downstream_table(),
            fk = stage.reference_column(),
        );
        let rows = sqlx::query(&sql)
            .bind(stage.as_str())
            .bind(now)
            .bind(&claim.worker_id)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await?;

        let expires_at = claim.expires_at(now);
        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let article = row_to_article(upstream, row)?;
            // The claims join above reads the statement snapshot, so a claim
            // committed since then is re-checked here under the row lock. A
            // conflicting live claim updates nothing and the row is skipped.
            let taken = sqlx::query(
                r#"
                INSERT INTO claims (stage, upstream_id, worker_id, expires_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (stage, upstream_id) DO UPDATE SET
                    worker_id = excluded.worker_id,
                    expires_at = excluded.expires_at
                WHERE claims.expires_at <= $5 OR claims.worker_id = excluded.worker_id
                "#,
            )
            .bind(stage.as_str())
            .bind(article.id())
            .bind(&claim.worker_id)
            .bind(expires_at)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if taken == 1 {
                claimed.push(Claimed {
                    article,
                    attempts: row.try_get::<i32, _>("attempts")? as u32,
                });
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn release_claims(
        &self,
        stage: Stage,
        worker_id: &str,
        upstream_ids: &[ArticleId],
    ) -> StorageResult<()> {
        sqlx::query("DELETE FROM claims WHERE stage = $1 AND worker_id = $2 AND upstream_id = ANY($3)")
            .bind(stage.as_str())
            .bind(worker_id)
            .bind(upstream_ids.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn renew_claims(
        &self,
        stage: Stage,
        upstream_ids: &[ArticleId],
        claim: &ClaimRequest,
    ) -> StorageResult<HashSet<ArticleId>> {
        let held: Vec<ArticleId> = sqlx::query_scalar(
            r#"
            UPDATE claims SET expires_at = $4
            WHERE stage = $1 AND worker_id = $2 AND upstream_id = ANY($3)
            RETURNING upstream_id
            "#,
        )
        .bind(stage.as_str())
        .bind(&claim.worker_id)
        .bind(upstream_ids.to_vec())
        .bind(claim.expires_at(Utc::now()))
        .fetch_all(&self.pool)
        .await?;
        Ok(held.into_iter().collect())
    }

    async fn record_failure(
        &self,
        stage: Stage,
        upstream_id: ArticleId,
        worker_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> StorageResult<FailureRecord> {
        if stage.upstream().is_none() {
            return Err(reads_source(stage));
        }
        let message: String = error.chars().take(MAX_ERROR_LEN).collect();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let attempts: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO failures (stage, upstream_id, attempts, last_error, last_failed_at, quarantined)
            VALUES ($1, $2, 1, $3, $4, FALSE)
            ON CONFLICT (stage, upstream_id) DO UPDATE SET
                attempts = failures.attempts + 1,
                last_error = excluded.last_error,
                last_failed_at = excluded.last_failed_at
            RETURNING attempts
            "#,
        )
        .bind(stage.as_str())
        .bind(upstream_id)
        .bind(&message)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let attempts = attempts as u32;

        let quarantined = max_attempts > 0 && attempts >= max_attempts;
        if quarantined {
            sqlx::query("UPDATE failures SET quarantined = TRUE WHERE stage = $1 AND upstream_id = $2")
                .bind(stage.as_str())
                .bind(upstream_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM claims WHERE stage = $1 AND upstream_id = $2 AND worker_id = $3")
            .bind(stage.as_str())
            .bind(upstream_id)
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(FailureRecord {
            stage,
            upstream_id,
            attempts,
            last_error: message,
            last_failed_at: now,
            quarantined,
        })
    }

    async fn known_sources(&self, source_ids: &[String]) -> StorageResult<HashSet<String>> {
        let known: Vec<String> =
            sqlx::query_scalar("SELECT source_id FROM raw_articles WHERE source_id = ANY($1)")
                .bind(source_ids.to_vec())
                .fetch_all(&self.pool)
                .await?;
        Ok(known.into_iter().collect())
    }

    async fn load_article(&self, stage: Stage, id: ArticleId) -> StorageResult<Option<Article>> {
        let sql = format!(
            "SELECT {} FROM {} t WHERE t.id = $1",
            select_columns(stage, "t"),
            stage.downstream_table()
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(|r| row_to_article(stage, r)).transpose()?)
    }

    async fn find_by_upstream(
        &self,
        stage: Stage,
        upstream_id: ArticleId,
    ) -> StorageResult<Vec<Article>> {
        if stage.upstream().is_none() {
            return Err(reads_source(stage));
        }
        let sql = format!(
            "SELECT {} FROM {} t WHERE t.{} = $1 ORDER BY t.id",
            select_columns(stage, "t"),
            stage.downstream_table(),
            stage.reference_column()
        );
        let rows = sqlx::query(&sql).bind(upstream_id).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| row_to_article(stage, r)).collect::<Result<_, _>>()?)
    }

    async fn list_articles(
        &self,
        stage: Stage,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StorageResult<Vec<Article>> {
        let sql = format!(
            r#"
            SELECT {} FROM {} t
            WHERE ($1::timestamptz IS NULL OR t.created_at > $1)
            ORDER BY t.created_at DESC, t.id DESC
            LIMIT $2
            "#,
            select_columns(stage, "t"),
            stage.downstream_table()
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| row_to_article(stage, r)).collect::<Result<_, _>>()?)
    }

    async fn quarantined(&self, stage: Stage) -> StorageResult<Vec<FailureRecord>> {
        if stage.upstream().is_none() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT f.upstream_id, f.attempts, f.last_error, f.last_failed_at
            FROM failures f
            WHERE f.stage = $1 AND f.quarantined
              AND NOT EXISTS (SELECT 1 FROM {down} d WHERE d.{fk} = f.upstream_id)
            ORDER BY f.last_failed_at ASC, f.upstream_id ASC
            "#,
            down = stage.downstream_table(),
            fk = stage.reference_column(),
        );
        let rows = sqlx::query(&sql).bind(stage.as_str()).fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(FailureRecord {
                stage,
                upstream_id: row.try_get("upstream_id")?,
                attempts: row.try_get::<i32, _>("attempts")? as u32,
                last_error: row.try_get("last_error")?,
                last_failed_at: row.try_get("last_failed_at")?,
                quarantined: true,
            });
        }
        Ok(records)
    }

    async fn release_quarantine(&self, stage: Stage, upstream_id: ArticleId) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM failures WHERE stage = $1 AND upstream_id = $2")
            .bind(stage.as_str())
            .bind(upstream_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stage_stats(&self, stage: Stage) -> StorageResult<StageStats> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS row_count, MAX(created_at) AS latest FROM {}",
            stage.downstream_table()
        ))
        .fetch_one(&self.pool)
        .await?;
        let rows: i64 = row.try_get("row_count")?;
        let latest: Option<DateTime<Utc>> = row.try_get("latest")?;

        let (backlog, quarantined) = match stage.upstream() {
            None => (0, 0),
            Some(upstream) => {
                let row = sqlx::query(&format!(
                    r#"
                    SELECT
                        COUNT(*) FILTER (WHERE NOT COALESCE(f.quarantined, FALSE)) AS backlog,
                        COUNT(*) FILTER (WHERE COALESCE(f.quarantined, FALSE)) AS quarantined
                    FROM {up} u
                    LEFT JOIN failures f ON f.stage = $1 AND f.upstream_id = u.id
                    WHERE NOT EXISTS (SELECT 1 FROM {down} d WHERE d.{fk} = u.id)
                    "#,
                    up = upstream.downstream_table(),
                    down = stage.downstream_table(),
                    fk = stage.reference_column(),
                ))
                .bind(stage.as_str())
                .fetch_one(&self.pool)
                .await?;
                (row.try_get::<i64, _>("backlog")?, row.try_get::<i64, _>("quarantined")?)
            }
        };

        Ok(StageStats {
            stage,
            rows: rows as u64,
            latest_created_at: latest,
            backlog: backlog as u64,
            quarantined: quarantined as u64,
        })
    }
}
