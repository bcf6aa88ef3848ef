//! Ingest stage: sources and the Ingestor processor
//!
//! A `Source` offers candidate documents; the ingest queue drops the ones
//! whose source identifier is already stored, and the `Ingestor` turns the
//! rest into raw article payloads.

use super::traits::{checked, expected, ProcessError, Processor};
use crate::article::{FetchedItem, Payload, Stage, StageInput};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Where raw content comes from.
///
/// `fetch` returns every candidate currently on offer, oldest first;
/// deduplication against the store happens in the ingest queue.
#[async_trait]
pub trait Source: Send + Sync {
    fn id(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<FetchedItem>, ProcessError>;
}

/// Source reading documents dropped into a spool directory.
///
/// Source identifier = file name + content hash, so an edited file is
/// ingested again while an unchanged one never is.
pub struct DirectorySource {
    id: String,
    dir: PathBuf,
    extensions: Vec<String>,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            id: format!("dir:{}", dir.display()),
            dir,
            extensions: vec!["html".into(), "htm".into(), "md".into(), "txt".into()],
        }
    }

    pub fn with_extensions(mut self, extensions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// Stable identifier for a file's current content.
    pub fn source_id(file_name: &str, content: &str) -> String {
        let digest = Uuid::new_v5(&Uuid::NAMESPACE_URL, content.as_bytes());
        format!("file:{}#{}", file_name, digest.simple())
    }
}

#[async_trait]
impl Source for DirectorySource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self) -> Result<Vec<FetchedItem>, ProcessError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| ProcessError::Source(format!("{}: {}", self.dir.display(), e)))?;

        let mut found: Vec<(DateTime<Utc>, String, PathBuf)> = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProcessError::Source(e.to_string()))?
        {
            let path = entry.path();
            if !self.accepts(&path) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let name = entry.file_name().to_string_lossy().to_string();
            found.push((modified, name, path));
        }
        found.sort();

        let mut items = Vec::with_capacity(found.len());
        for (modified, name, path) in found {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            items.push(FetchedItem {
                source_id: Self::source_id(&name, &content),
                payload: content,
                fetched_at: modified,
            });
        }
        Ok(items)
    }
}

/// In-memory source; items stay on offer until the store knows them.
#[derive(Default)]
pub struct MemorySource {
    items: Mutex<Vec<FetchedItem>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: FetchedItem) {
        self.items.lock().unwrap().push(item);
    }
}

#[async_trait]
impl Source for MemorySource {
    fn id(&self) -> &str {
        "memory"
    }

    async fn fetch(&self) -> Result<Vec<FetchedItem>, ProcessError> {
        Ok(self.items.lock().unwrap().clone())
    }
}

/// Ingest processor: accepts fetched content as a raw article.
pub struct Ingestor {
    max_payload_bytes: usize,
}

impl Ingestor {
    pub fn new() -> Self {
        Self {
            max_payload_bytes: 2 * 1024 * 1024,
        }
    }

    pub fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }
}

impl Default for Ingestor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for Ingestor {
    fn id(&self) -> &str {
        "ingestor"
    }

    fn stage(&self) -> Stage {
        Stage::Ingest
    }

    async fn process(&self, input: &StageInput) -> Result<Payload, ProcessError> {
        let item = input.as_fetched().ok_or_else(|| expected(Stage::Ingest, input))?;
        if item.payload.len() > self.max_payload_bytes {
            return Err(ProcessError::Malformed(format!(
                "payload of {} bytes exceeds {}",
                item.payload.len(),
                self.max_payload_bytes
            )));
        }
        checked(Payload::Raw {
            payload: item.payload.clone(),
        })
    }
}
