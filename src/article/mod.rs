//! Article records for the four pipeline stages
//!
//! Each stage owns one append-only table. Rows reference exactly one row of
//! the previous stage and are never updated once written.

mod stage;
mod types;

pub use stage::Stage;
pub use types::{
    Article, ArticleId, CategorizedArticle, CommentaryArticle, FetchedItem, ParsedArticle,
    Payload, RawArticle, StageInput, UpstreamKey,
};
