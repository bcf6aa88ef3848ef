//! SQLite storage backend for newswire

use super::traits::{
    ArticleStore, ClaimRequest, Claimed, FailureRecord, OpenStore, StageStats, StorageError,
    StorageResult,
};
use crate::article::{
    Article, ArticleId, CategorizedArticle, CommentaryArticle, ParsedArticle, Payload, RawArticle,
    Stage, UpstreamKey,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Default time a writer waits on a locked database file.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(3);

/// Longest failure message kept in the failures table.
const MAX_ERROR_LEN: usize = 2000;

/// SQLite-backed article store
///
/// One database file holds the four stage tables plus the `claims` and
/// `failures` bookkeeping tables. Thread-safe via internal mutex on the
/// connection; separate processes coordinate through SQLite's file lock,
/// every write transaction being `BEGIN IMMEDIATE`.
///
/// Claims stand in for row locks: `select_unprocessed` picks rows whose
/// claim is absent, expired or already ours and takes a lease on them in
/// the same write transaction, so concurrent workers partition the backlog
/// instead of waiting on each other.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Fixed-width RFC 3339 so text comparison orders timestamps correctly.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StorageError::DateParse(e.to_string()))
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Column list of a stage table, qualified with `alias`.
fn select_columns(stage: Stage, alias: &str) -> String {
    stage
        .columns()
        .iter()
        .map(|c| format!("{}.{}", alias, c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Deserialize a row selected with `select_columns(stage, ..)`.
fn row_to_article(stage: Stage, row: &Row<'_>) -> rusqlite::Result<Article> {
    Ok(match stage {
        Stage::Ingest => Article::Raw(RawArticle {
            id: row.get(0)?,
            source_id: row.get(1)?,
            payload: row.get(2)?,
            created_at: ts_column(row, 3)?,
        }),
        Stage::Parse => Article::Parsed(ParsedArticle {
            id: row.get(0)?,
            raw_article_id: row.get(1)?,
            title: row.get(2)?,
            body: row.get(3)?,
            created_at: ts_column(row, 4)?,
        }),
        Stage::Categorize => Article::Categorized(CategorizedArticle {
            id: row.get(0)?,
            parsed_article_id: row.get(1)?,
            category: row.get(2)?,
            confidence: row.get(3)?,
            created_at: ts_column(row, 4)?,
        }),
        Stage::Comment => Article::Commentary(CommentaryArticle {
            id: row.get(0)?,
            categorized_article_id: row.get(1)?,
            content: row.get(2)?,
            created_at: ts_column(row, 3)?,
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

impl SqliteStore {
    /// Initialize the database schema
    ///
    /// Reference columns are UNIQUE: that constraint, not application
    /// logic, is what makes a repeated hand-off a no-op.
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            -- Stage 1: raw content, one row per source identifier
            CREATE TABLE IF NOT EXISTS raw_articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL UNIQUE,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            -- Stage 2: extracted text, one row per raw article
            CREATE TABLE IF NOT EXISTS parsed_articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                raw_article_id INTEGER NOT NULL UNIQUE REFERENCES raw_articles(id),
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            -- Stage 3: topic, one row per parsed article
            CREATE TABLE IF NOT EXISTS categorized_articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parsed_article_id INTEGER NOT NULL UNIQUE REFERENCES parsed_articles(id),
                category TEXT NOT NULL,
                confidence REAL NOT NULL,
                created_at TEXT NOT NULL
            );

            -- Stage 4: commentary, one row per categorized article
            CREATE TABLE IF NOT EXISTS commentary_articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                categorized_article_id INTEGER NOT NULL UNIQUE REFERENCES categorized_articles(id),
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            -- Oldest-first claim order
            CREATE INDEX IF NOT EXISTS idx_raw_created ON raw_articles(created_at, id);
            CREATE INDEX IF NOT EXISTS idx_parsed_created ON parsed_articles(created_at, id);
            CREATE INDEX IF NOT EXISTS idx_categorized_created ON categorized_articles(created_at, id);
            CREATE INDEX IF NOT EXISTS idx_commentary_created ON commentary_articles(created_at, id);

            -- Leases on upstream rows, keyed by the claiming stage
            CREATE TABLE IF NOT EXISTS claims (
                stage TEXT NOT NULL,
                upstream_id INTEGER NOT NULL,
                worker_id TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (stage, upstream_id)
            );

            -- Failed attempts per upstream row, keyed by the failing stage
            CREATE TABLE IF NOT EXISTS failures (
                stage TEXT NOT NULL,
                upstream_id INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT NOT NULL,
                last_failed_at TEXT NOT NULL,
                quarantined INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (stage, upstream_id)
            );

            PRAGMA foreign_keys = ON;

            -- Readers never block the writer
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    /// Open or create a store, waiting up to `busy_timeout` on a locked file.
    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn upstream_created_at(
        conn: &Connection,
        upstream: Stage,
        id: ArticleId,
    ) -> StorageResult<DateTime<Utc>> {
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT created_at FROM {} WHERE id = ?1", upstream.downstream_table()),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => parse_ts(&raw),
            None => Err(StorageError::MissingUpstream { stage: upstream, id }),
        }
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl ArticleStore for SqliteStore {
    // === Hand-off primitives ===

    async fn insert_if_absent(
        &self,
        upstream: &UpstreamKey,
        payload: &Payload,
    ) -> StorageResult<bool> {
        let stage = payload.stage();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let changed = match upstream {
            UpstreamKey::Source(source_id) => {
                let Payload::Raw { payload: body } = payload else {
                    return Err(mismatch(upstream, payload));
                };
                tx.execute(
                    r#"
                    INSERT INTO raw_articles (source_id, payload, created_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(source_id) DO NOTHING
                    "#,
                    params![source_id, body, format_ts(now)],
                )?
            }
            UpstreamKey::Article(upstream_id) => {
                let Some(upstream_stage) = stage.upstream() else {
                    return Err(mismatch(upstream, payload));
                };
                // Strictly after the upstream row, even at clock resolution limits
                let upstream_created = Self::upstream_created_at(&tx, upstream_stage, *upstream_id)?;
                let created_at =
                    format_ts(now.max(upstream_created + chrono::Duration::microseconds(1)));

                let changed = match payload {
                    Payload::Parsed { title, body } => tx.execute(
                        r#"
                        INSERT INTO parsed_articles (raw_article_id, title, body, created_at)
                        VALUES (?1, ?2, ?3, ?4)
                        ON CONFLICT(raw_article_id) DO NOTHING
                        "#,
                        params![upstream_id, title, body, created_at],
                    )?,
                    Payload::Categorized { category, confidence } => tx.execute(
                        r#"
                        INSERT INTO categorized_articles (parsed_article_id, category, confidence, created_at)
                        VALUES (?1, ?2, ?3, ?4)
                        ON CONFLICT(parsed_article_id) DO NOTHING
                        "#,
                        params![upstream_id, category, confidence, created_at],
                    )?,
                    Payload::Commentary { content } => tx.execute(
                        r#"
                        INSERT INTO commentary_articles (categorized_article_id, content, created_at)
                        VALUES (?1, ?2, ?3)
                        ON CONFLICT(categorized_article_id) DO NOTHING
                        "#,
                        params![upstream_id, content, created_at],
                    )?,
                    Payload::Raw { .. } => return Err(mismatch(upstream, payload)),
                };

                tx.execute(
                    "DELETE FROM claims WHERE stage = ?1 AND upstream_id = ?2",
                    params![stage.as_str(), upstream_id],
                )?;
                changed
            }
        };

        tx.commit()?;
        Ok(changed == 1)
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

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let sql = format!(
            r#"
            SELECT {cols}, COALESCE(f.attempts, 0)
            FROM {up} u
            LEFT JOIN {down} d ON d.{fk} = u.id
            LEFT JOIN claims c ON c.stage = ?1 AND c.upstream_id = u.id
            LEFT JOIN failures f ON f.stage = ?1 AND f.upstream_id = u.id
            WHERE d.id IS NULL
              AND (c.upstream_id IS NULL OR c.expires_at <= ?2 OR c.worker_id = ?3)
              AND (f.quarantined IS NULL OR f.quarantined = 0)
            ORDER BY u.created_at ASC, u.id ASC
            LIMIT ?4
            "#,
            cols = select_columns(upstream, "u"),
            up = upstream.downstream_table(),
            down = stage.downstream_table(),
            fk = stage.reference_column(),
        );
        let attempts_idx = upstream.columns().len();

        let claimed: Vec<Claimed> = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(
                params![stage.as_str(), format_ts(now), claim.worker_id, limit as i64],
                |row| {
                    Ok(Claimed {
                        article: row_to_article(upstream, row)?,
                        attempts: row.get::<_, i64>(attempts_idx)? as u32,
                    })
                },
            )?;
            rows.collect::<Result<_, _>>()?
        };

        let expires_at = format_ts(claim.expires_at(now));
        for c in &claimed {
            tx.execute(
                r#"
                INSERT INTO claims (stage, upstream_id, worker_id, expires_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(stage, upstream_id) DO UPDATE SET
                    worker_id = excluded.worker_id,
                    expires_at = excluded.expires_at
                "#,
                params![stage.as_str(), c.article.id(), claim.worker_id, expires_at],
            )?;
        }

        tx.commit()?;
        Ok(claimed)
    }

    async fn release_claims(
        &self,
        stage: Stage,
        worker_id: &str,
        upstream_ids: &[ArticleId],
    ) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for id in upstream_ids {
            tx.execute(
                "DELETE FROM claims WHERE stage = ?1 AND upstream_id = ?2 AND worker_id = ?3",
                params![stage.as_str(), id, worker_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn renew_claims(
        &self,
        stage: Stage,
        upstream_ids: &[ArticleId],
        claim: &ClaimRequest,
    ) -> StorageResult<HashSet<ArticleId>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let expires_at = format_ts(claim.expires_at(Utc::now()));

        let mut held = HashSet::new();
        for id in upstream_ids {
            let renewed = tx.execute(
                r#"
                UPDATE claims SET expires_at = ?4
                WHERE stage = ?1 AND upstream_id = ?2 AND worker_id = ?3
                "#,
                params![stage.as_str(), id, claim.worker_id, expires_at],
            )?;
            if renewed == 1 {
                held.insert(*id);
            }
        }
        tx.commit()?;
        Ok(held)
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

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            r#"
            INSERT INTO failures (stage, upstream_id, attempts, last_error, last_failed_at, quarantined)
            VALUES (?1, ?2, 1, ?3, ?4, 0)
            ON CONFLICT(stage, upstream_id) DO UPDATE SET
                attempts = failures.attempts + 1,
                last_error = excluded.last_error,
                last_failed_at = excluded.last_failed_at
            "#,
            params![stage.as_str(), upstream_id, message, format_ts(now)],
        )?;
        let attempts: i64 = tx.query_row(
            "SELECT attempts FROM failures WHERE stage = ?1 AND upstream_id = ?2",
            params![stage.as_str(), upstream_id],
            |row| row.get(0),
        )?;
        let attempts = attempts as u32;

        let quarantined = max_attempts > 0 && attempts >= max_attempts;
        if quarantined {
            tx.execute(
                "UPDATE failures SET quarantined = 1 WHERE stage = ?1 AND upstream_id = ?2",
                params![stage.as_str(), upstream_id],
            )?;
        }
        tx.execute(
            "DELETE FROM claims WHERE stage = ?1 AND upstream_id = ?2 AND worker_id = ?3",
            params![stage.as_str(), upstream_id, worker_id],
        )?;
        tx.commit()?;

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
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT 1 FROM raw_articles WHERE source_id = ?1")?;
        let mut known = HashSet::new();
        for source_id in source_ids {
            if stmt.exists(params![source_id])? {
                known.insert(source_id.clone());
            }
        }
        Ok(known)
    }

    // === Inspection ===

    async fn load_article(&self, stage: Stage, id: ArticleId) -> StorageResult<Option<Article>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM {} t WHERE t.id = ?1",
            select_columns(stage, "t"),
            stage.downstream_table()
        );
        let article = conn
            .query_row(&sql, params![id], |row| row_to_article(stage, row))
            .optional()?;
        Ok(article)
    }

    async fn find_by_upstream(
        &self,
        stage: Stage,
        upstream_id: ArticleId,
    ) -> StorageResult<Vec<Article>> {
        if stage.upstream().is_none() {
            return Err(reads_source(stage));
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM {} t WHERE t.{} = ?1 ORDER BY t.id",
            select_columns(stage, "t"),
            stage.downstream_table(),
            stage.reference_column()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![upstream_id], |row| row_to_article(stage, row))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn list_articles(
        &self,
        stage: Stage,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StorageResult<Vec<Article>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            r#"
            SELECT {} FROM {} t
            WHERE (?1 IS NULL OR t.created_at > ?1)
            ORDER BY t.created_at DESC, t.id DESC
            LIMIT ?2
            "#,
            select_columns(stage, "t"),
            stage.downstream_table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![since.map(format_ts), limit as i64], |row| {
            row_to_article(stage, row)
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn quarantined(&self, stage: Stage) -> StorageResult<Vec<FailureRecord>> {
        if stage.upstream().is_none() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            r#"
            SELECT f.upstream_id, f.attempts, f.last_error, f.last_failed_at
            FROM failures f
            LEFT JOIN {down} d ON d.{fk} = f.upstream_id
            WHERE f.stage = ?1 AND f.quarantined = 1 AND d.id IS NULL
            ORDER BY f.last_failed_at ASC, f.upstream_id ASC
            "#,
            down = stage.downstream_table(),
            fk = stage.reference_column(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![stage.as_str()], |row| {
            Ok(FailureRecord {
                stage,
                upstream_id: row.get(0)?,
                attempts: row.get::<_, i64>(1)? as u32,
                last_error: row.get(2)?,
                last_failed_at: ts_column(row, 3)?,
                quarantined: true,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    async fn release_quarantine(&self, stage: Stage, upstream_id: ArticleId) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM failures WHERE stage = ?1 AND upstream_id = ?2",
            params![stage.as_str(), upstream_id],
        )?;
        Ok(removed > 0)
    }

    async fn stage_stats(&self, stage: Stage) -> StorageResult<StageStats> {
        let conn = self.conn.lock().unwrap();

        let (rows, latest): (i64, Option<String>) = conn.query_row(
            &format!("SELECT COUNT(*), MAX(created_at) FROM {}", stage.downstream_table()),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let (backlog, quarantined) = match stage.upstream() {
            None => (0, 0),
            Some(upstream) => conn.query_row(
                &format!(
                    r#"
                    SELECT
                        COALESCE(SUM(CASE WHEN COALESCE(f.quarantined, 0) = 0 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN f.quarantined = 1 THEN 1 ELSE 0 END), 0)
                    FROM {up} u
                    LEFT JOIN {down} d ON d.{fk} = u.id
                    LEFT JOIN failures f ON f.stage = ?1 AND f.upstream_id = u.id
                    WHERE d.id IS NULL
                    "#,
                    up = upstream.downstream_table(),
                    down = stage.downstream_table(),
                    fk = stage.reference_column(),
                ),
                params![stage.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )?,
        };

        Ok(StageStats {
            stage,
            rows: rows as u64,
            latest_created_at: latest.as_deref().map(parse_ts).transpose()?,
            backlog: backlog as u64,
            quarantined: quarantined as u64,
        })
    }
}
