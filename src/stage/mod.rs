//! Stage processing functions
//!
//! One processor per stage, each built around a pluggable piece (source,
//! extractor, classifier, commentator) so deployments can swap the
//! heuristics for a model without touching the worker loop.

mod categorize;
mod comment;
mod ingest;
mod parse;
mod traits;

pub use categorize::{
    Categorizer, Classification, Classifier, KeywordClassifier, ModelClassifier, UNCATEGORIZED,
};
pub use comment::{CommentContext, Commentator, CommentaryGenerator, LeadCommentator, ModelCommentator};
pub use ingest::{DirectorySource, Ingestor, MemorySource, Source};
pub use parse::{ArticleParser, Extracted, MarkdownExtractor, TextExtractor};
pub use traits::{ProcessError, Processor};
