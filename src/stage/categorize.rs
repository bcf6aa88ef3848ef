//! Categorize stage: assign a category and confidence to parsed articles

use super::traits::{checked, expected, truncate_chars, ProcessError, Processor};
use crate::article::{ParsedArticle, Payload, Stage, StageInput};
use crate::model::{LanguageModel, ModelError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Body characters included in a classification prompt
const PROMPT_BODY_CHARS: usize = 4000;

/// Category used when nothing matches
pub const UNCATEGORIZED: &str = "general";

/// A category with its confidence in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: String,
    pub confidence: f64,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, article: &ParsedArticle) -> Result<Classification, ProcessError>;
}

#[derive(Debug, Deserialize)]
struct ClassificationReply {
    category: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Asks a language model to pick one of the configured categories.
///
/// The model is expected to answer with a JSON object
/// `{"category": "...", "confidence": 0.0..1.0}`; prose around the object
/// is tolerated. A bare category name is accepted at confidence 0.5.
pub struct ModelClassifier {
    model: Arc<dyn LanguageModel>,
    categories: Vec<String>,
}

impl ModelClassifier {
    pub fn new(model: Arc<dyn LanguageModel>, categories: Vec<String>) -> Self {
        let categories = categories.into_iter().map(|c| c.to_lowercase()).collect();
        Self { model, categories }
    }

    fn prompt(&self, article: &ParsedArticle) -> String {
        format!(
            "Classify the news article into exactly one of these categories: {}.\n\
             Reply with JSON only: {{\"category\": \"<category>\", \"confidence\": <0.0-1.0>}}\n\n\
             Title: {}\n\n{}",
            self.categories.join(", "),
            article.title,
            truncate_chars(&article.body, PROMPT_BODY_CHARS)
        )
    }

    fn interpret(&self, response: &str) -> Result<Classification, ProcessError> {
        let reply = match (response.find('{'), response.rfind('}')) {
            (Some(start), Some(end)) if start < end => {
                serde_json::from_str::<ClassificationReply>(&response[start..=end])
                    .map_err(|e| ModelError::ParseError(e.to_string()))?
            }
            _ => ClassificationReply {
                category: response.trim().trim_matches('"').to_string(),
                confidence: Some(0.5),
            },
        };

        let category = reply.category.trim().to_lowercase();
        if category.is_empty() {
            return Err(ModelError::ParseError("empty category".to_string()).into());
        }
        if !self.categories.is_empty() && !self.categories.contains(&category) {
            return Err(ProcessError::Malformed(format!(
                "model answered unknown category '{}'",
                category
            )));
        }
        let confidence = reply.confidence.unwrap_or(0.5);
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ProcessError::Malformed(format!(
                "model answered confidence {}",
                confidence
            )));
        }
        Ok(Classification { category, confidence })
    }
}

#[async_trait]
impl Classifier for ModelClassifier {
    fn name(&self) -> &str {
        self.model.name()
    }

    async fn classify(&self, article: &ParsedArticle) -> Result<Classification, ProcessError> {
        let response = self.model.complete(&self.prompt(article)).await?;
        self.interpret(&response)
    }
}

/// Scores categories by keyword hits in title and body.
///
/// Title words count double. Confidence is the winning category's share
/// of all hits; no hits yields `general` at zero confidence.
pub struct KeywordClassifier {
    rules: Vec<(String, Vec<String>)>,
}

impl KeywordClassifier {
    pub fn new(rules: Vec<(String, Vec<String>)>) -> Self {
        Self { rules }
    }

    /// Rules covering the default category list.
    pub fn news_defaults() -> Self {
        let table: &[(&str, &[&str])] = &[
            ("politics", &["election", "senate", "parliament", "minister", "vote", "president", "policy", "campaign"]),
            ("business", &["market", "markets", "stocks", "shares", "profit", "earnings", "bank", "economy", "inflation"]),
            ("technology", &["software", "ai", "chip", "startup", "app", "internet", "cyber", "computer", "tech"]),
            ("science", &["research", "scientists", "study", "space", "nasa", "physics", "climate", "species"]),
            ("health", &["health", "hospital", "virus", "vaccine", "disease", "patients", "medical", "doctors"]),
            ("sports", &["match", "league", "goal", "championship", "team", "coach", "season", "tournament"]),
            ("entertainment", &["film", "movie", "music", "album", "celebrity", "festival", "tv", "actor"]),
            ("world", &["war", "united", "nations", "embassy", "border", "refugees", "treaty", "foreign"]),
        ];
        Self::new(
            table
                .iter()
                .map(|(cat, words)| {
                    (cat.to_string(), words.iter().map(|w| w.to_string()).collect())
                })
                .collect(),
        )
    }

    fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    fn name(&self) -> &str {
        "keywords"
    }

    async fn classify(&self, article: &ParsedArticle) -> Result<Classification, ProcessError> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for token in Self::tokens(&article.title) {
            *counts.entry(token).or_default() += 2;
        }
        for token in Self::tokens(&article.body) {
            *counts.entry(token).or_default() += 1;
        }

        let mut best: Option<(&str, usize)> = None;
        let mut total = 0;
        for (category, words) in &self.rules {
            let hits: usize = words.iter().filter_map(|w| counts.get(w)).sum();
            total += hits;
            if hits > best.map(|(_, h)| h).unwrap_or(0) {
                best = Some((category.as_str(), hits));
            }
        }

        Ok(match best {
            Some((category, hits)) => Classification {
                category: category.to_string(),
                confidence: hits as f64 / total as f64,
            },
            None => Classification {
                category: UNCATEGORIZED.to_string(),
                confidence: 0.0,
            },
        })
    }
}

/// Categorize processor: parsed article to category and confidence.
pub struct Categorizer {
    classifier: Arc<dyn Classifier>,
}

impl Categorizer {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self { classifier }
    }
}

#[async_trait]
impl Processor for Categorizer {
    fn id(&self) -> &str {
        "categorizer"
    }

    fn stage(&self) -> Stage {
        Stage::Categorize
    }

    async fn process(&self, input: &StageInput) -> Result<Payload, ProcessError> {
        let parsed = input
            .as_parsed()
            .ok_or_else(|| expected(Stage::Categorize, input))?;
        let classification = self.classifier.classify(parsed).await?;
        tracing::debug!(
            classifier = self.classifier.name(),
            article = parsed.id,
            category = %classification.category,
            confidence = classification.confidence,
            "classified"
        );
        checked(Payload::Categorized {
            category: classification.category,
            confidence: classification.confidence,
        })
    }
}
