//! Pipeline stages and the table pair each one owns

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One phase of the pipeline.
///
/// A stage reads its upstream table (or an external source, for ingestion)
/// and writes its downstream table. Stages never write a table they don't own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Ingest,
    Parse,
    Categorize,
    Comment,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Ingest, Stage::Parse, Stage::Categorize, Stage::Comment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Parse => "parse",
            Self::Categorize => "categorize",
            Self::Comment => "comment",
        }
    }

    /// The table this stage writes.
    pub fn downstream_table(&self) -> &'static str {
        match self {
            Self::Ingest => "raw_articles",
            Self::Parse => "parsed_articles",
            Self::Categorize => "categorized_articles",
            Self::Comment => "commentary_articles",
        }
    }

    /// The stage whose table this stage reads. `None` for ingestion.
    pub fn upstream(&self) -> Option<Stage> {
        match self {
            Self::Ingest => None,
            Self::Parse => Some(Self::Ingest),
            Self::Categorize => Some(Self::Parse),
            Self::Comment => Some(Self::Categorize),
        }
    }

    /// The table this stage reads. `None` for ingestion.
    pub fn upstream_table(&self) -> Option<&'static str> {
        self.upstream().map(|s| s.downstream_table())
    }

    /// Column in the downstream table referencing the upstream row.
    ///
    /// For ingestion this is the source identifier column.
    pub fn reference_column(&self) -> &'static str {
        match self {
            Self::Ingest => "source_id",
            Self::Parse => "raw_article_id",
            Self::Categorize => "parsed_article_id",
            Self::Comment => "categorized_article_id",
        }
    }

    /// Columns of the table this stage writes, in storage order.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Self::Ingest => &["id", "source_id", "payload", "created_at"],
            Self::Parse => &["id", "raw_article_id", "title", "body", "created_at"],
            Self::Categorize => &["id", "parsed_article_id", "category", "confidence", "created_at"],
            Self::Comment => &["id", "categorized_article_id", "content", "created_at"],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ingest" | "ingestor" | "scrape" => Ok(Self::Ingest),
            "parse" | "parser" => Ok(Self::Parse),
            "categorize" | "categorizer" => Ok(Self::Categorize),
            "comment" | "commentary" => Ok(Self::Comment),
            other => Err(format!(
                "unknown stage '{}' (expected ingest, parse, categorize or comment)",
                other
            )),
        }
    }
}
