//! Processor trait: the contract every stage's processing function implements
//!
//! A processor transforms one upstream record into the payload of one
//! downstream row. It never writes to the store; the worker commits its
//! result.

use crate::article::{Payload, Stage, StageInput};
use crate::model::ModelError;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors from processing a single record.
///
/// None of these are fatal to a worker: the record is deferred and offered
/// again on a later tick.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("source error: {0}")]
    Source(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("processor error: {0}")]
    Internal(String),
}

/// The processing function of one stage.
///
/// Implementations match on `input` for the record kind they consume. If
/// the record is of another kind, return `Err(ProcessError::InvalidInput)`.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Unique identifier for logs
    fn id(&self) -> &str;

    /// The stage whose table the returned payload lands in
    fn stage(&self) -> Stage;

    async fn process(&self, input: &StageInput) -> Result<Payload, ProcessError>;
}

pub(crate) fn expected(stage: Stage, input: &StageInput) -> ProcessError {
    let got = match input {
        StageInput::Fetched(_) => "fetched item".to_string(),
        StageInput::Stored(article) => format!("{} row", article.stage()),
    };
    ProcessError::InvalidInput(format!("{} cannot process a {}", stage, got))
}

/// Check the payload against its table's non-null requirements.
pub(crate) fn checked(payload: Payload) -> Result<Payload, ProcessError> {
    payload.validate().map_err(ProcessError::Malformed)?;
    Ok(payload)
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::FetchedItem;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn expected_names_both_sides() {
        let err = expected(Stage::Parse, &StageInput::Fetched(FetchedItem::new("a", "b")));
        assert!(err.to_string().contains("parse cannot process a fetched item"));
    }
}
