//! Record types stored at each stage

use super::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row identifier within one stage table.
pub type ArticleId = i64;

/// Content as fetched from a source, deduplicated on `source_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawArticle {
    pub id: ArticleId,
    pub source_id: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedArticle {
    pub id: ArticleId,
    pub raw_article_id: ArticleId,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizedArticle {
    pub id: ArticleId,
    pub parsed_article_id: ArticleId,
    pub category: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentaryArticle {
    pub id: ArticleId,
    pub categorized_article_id: ArticleId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A stored row from any stage table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum Article {
    Raw(RawArticle),
    Parsed(ParsedArticle),
    Categorized(CategorizedArticle),
    Commentary(CommentaryArticle),
}

impl Article {
    pub fn id(&self) -> ArticleId {
        match self {
            Self::Raw(a) => a.id,
            Self::Parsed(a) => a.id,
            Self::Categorized(a) => a.id,
            Self::Commentary(a) => a.id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Raw(a) => a.created_at,
            Self::Parsed(a) => a.created_at,
            Self::Categorized(a) => a.created_at,
            Self::Commentary(a) => a.created_at,
        }
    }

    /// The stage that wrote this row.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Raw(_) => Stage::Ingest,
            Self::Parsed(_) => Stage::Parse,
            Self::Categorized(_) => Stage::Categorize,
            Self::Commentary(_) => Stage::Comment,
        }
    }

    /// The upstream row this one was derived from. `None` for raw articles.
    pub fn upstream_id(&self) -> Option<ArticleId> {
        match self {
            Self::Raw(_) => None,
            Self::Parsed(a) => Some(a.raw_article_id),
            Self::Categorized(a) => Some(a.parsed_article_id),
            Self::Commentary(a) => Some(a.categorized_article_id),
        }
    }
}

/// Content offered by an ingest source, not yet stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedItem {
    pub source_id: String,
    pub payload: String,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedItem {
    pub fn new(source_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            payload: payload.into(),
            fetched_at: Utc::now(),
        }
    }
}

/// Identifies the upstream side of a hand-off.
///
/// Ingestion is keyed by the source identifier; every other stage by the
/// upstream row id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpstreamKey {
    Source(String),
    Article(ArticleId),
}

impl std::fmt::Display for UpstreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(s) => write!(f, "source:{}", s),
            Self::Article(id) => write!(f, "#{}", id),
        }
    }
}

/// What a processing function hands to its worker for an upstream record.
///
/// A processor only ever returns the variant for its own stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Raw { payload: String },
    Parsed { title: String, body: String },
    Categorized { category: String, confidence: f64 },
    Commentary { content: String },
}

impl Payload {
    /// The stage whose table this payload lands in.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Raw { .. } => Stage::Ingest,
            Self::Parsed { .. } => Stage::Parse,
            Self::Categorized { .. } => Stage::Categorize,
            Self::Commentary { .. } => Stage::Comment,
        }
    }

    /// Checks the non-null payload fields each table requires.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Raw { payload } if payload.trim().is_empty() => Err("empty raw payload".into()),
            Self::Parsed { body, .. } if body.trim().is_empty() => Err("empty body".into()),
            Self::Categorized { category, .. } if category.trim().is_empty() => {
                Err("empty category".into())
            }
            Self::Categorized { confidence, .. } if !(0.0..=1.0).contains(confidence) => {
                Err(format!("confidence {} outside [0, 1]", confidence))
            }
            Self::Commentary { content } if content.trim().is_empty() => {
                Err("empty commentary".into())
            }
            _ => Ok(()),
        }
    }
}

/// The record a worker hands to a processing function.
#[derive(Debug, Clone, PartialEq)]
pub enum StageInput {
    Fetched(FetchedItem),
    Stored(Article),
}

impl StageInput {
    pub fn as_fetched(&self) -> Option<&FetchedItem> {
        match self {
            Self::Fetched(item) => Some(item),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&RawArticle> {
        match self {
            Self::Stored(Article::Raw(a)) => Some(a),
            _ => None,
        }
    }

    pub fn as_parsed(&self) -> Option<&ParsedArticle> {
        match self {
            Self::Stored(Article::Parsed(a)) => Some(a),
            _ => None,
        }
    }

    pub fn as_categorized(&self) -> Option<&CategorizedArticle> {
        match self {
            Self::Stored(Article::Categorized(a)) => Some(a),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_validation_rejects_empty_fields() {
        assert!(Payload::Raw { payload: "  ".into() }.validate().is_err());
        assert!(Payload::Parsed { title: "".into(), body: "text".into() }.validate().is_ok());
        assert!(Payload::Categorized { category: "".into(), confidence: 0.5 }.validate().is_err());
        assert!(Payload::Categorized { category: "tech".into(), confidence: 1.5 }.validate().is_err());
        assert!(Payload::Commentary { content: "\n".into() }.validate().is_err());
    }

    #[test]
    fn payload_nan_confidence_is_rejected() {
        let payload = Payload::Categorized { category: "tech".into(), confidence: f64::NAN };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn stage_input_accessors_match_variant() {
        let input = StageInput::Fetched(FetchedItem::new("a", "b"));
        assert!(input.as_fetched().is_some());
        assert!(input.as_raw().is_none());
        assert!(input.as_parsed().is_none());
    }
}
