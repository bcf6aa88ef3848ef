//! Commentary stage: write a short commentary for categorized articles

use super::traits::{checked, expected, truncate_chars, ProcessError, Processor};
use crate::article::{Article, CategorizedArticle, ParsedArticle, Payload, Stage, StageInput};
use crate::model::LanguageModel;
use crate::storage::ArticleStore;
use async_trait::async_trait;
use std::sync::Arc;

const PROMPT_BODY_CHARS: usize = 4000;
const LEAD_CHARS: usize = 280;

/// What a commentator sees: the categorized row, and the parsed article
/// behind it when the store could supply it.
#[derive(Debug, Clone)]
pub struct CommentContext {
    pub categorized: CategorizedArticle,
    pub parsed: Option<ParsedArticle>,
}

#[async_trait]
pub trait Commentator: Send + Sync {
    fn name(&self) -> &str;

    async fn comment(&self, context: &CommentContext) -> Result<String, ProcessError>;
}

/// Commentary written by a language model.
pub struct ModelCommentator {
    model: Arc<dyn LanguageModel>,
    max_words: usize,
}

impl ModelCommentator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model, max_words: 80 }
    }

    pub fn with_max_words(mut self, max_words: usize) -> Self {
        self.max_words = max_words;
        self
    }

    fn prompt(&self, context: &CommentContext) -> String {
        let mut prompt = format!(
            "Write a short commentary (at most {} words) on this {} news article.\n",
            self.max_words, context.categorized.category
        );
        if let Some(parsed) = &context.parsed {
            prompt.push_str(&format!(
                "\nTitle: {}\n\n{}\n",
                parsed.title,
                truncate_chars(&parsed.body, PROMPT_BODY_CHARS)
            ));
        }
        prompt
    }
}

#[async_trait]
impl Commentator for ModelCommentator {
    fn name(&self) -> &str {
        self.model.name()
    }

    async fn comment(&self, context: &CommentContext) -> Result<String, ProcessError> {
        let reply = self.model.complete(&self.prompt(context)).await?;
        Ok(reply.trim().to_string())
    }
}

/// Model-free commentary built from the category and the article's lead.
#[derive(Debug, Default)]
pub struct LeadCommentator;

#[async_trait]
impl Commentator for LeadCommentator {
    fn name(&self) -> &str {
        "lead"
    }

    async fn comment(&self, context: &CommentContext) -> Result<String, ProcessError> {
        let c = &context.categorized;
        let percent = (c.confidence * 100.0).round();
        Ok(match &context.parsed {
            Some(parsed) => {
                let lead = parsed.body.split("\n\n").next().unwrap_or_default();
                format!(
                    "[{}, {}%] {}: {}",
                    c.category,
                    percent,
                    parsed.title,
                    truncate_chars(lead, LEAD_CHARS)
                )
            }
            None => format!("Filed under {} with {}% confidence.", c.category, percent),
        })
    }
}

/// Commentary processor: categorized article to commentary.
///
/// With a store attached, the parsed article is read for context; a failed
/// read defers the record.
pub struct CommentaryGenerator {
    commentator: Arc<dyn Commentator>,
    store: Option<Arc<dyn ArticleStore>>,
}

impl CommentaryGenerator {
    pub fn new(commentator: Arc<dyn Commentator>) -> Self {
        Self {
            commentator,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ArticleStore>) -> Self {
        self.store = Some(store);
        self
    }

    async fn context(&self, categorized: &CategorizedArticle) -> Result<CommentContext, ProcessError> {
        let parsed = match &self.store {
            Some(store) => match store
                .load_article(Stage::Parse, categorized.parsed_article_id)
                .await
                .map_err(|e| ProcessError::Internal(e.to_string()))?
            {
                Some(Article::Parsed(parsed)) => Some(parsed),
                _ => None,
            },
            None => None,
        };
        Ok(CommentContext {
            categorized: categorized.clone(),
            parsed,
        })
    }
}

#[async_trait]
impl Processor for CommentaryGenerator {
    fn id(&self) -> &str {
        "commentary-generator"
    }

    fn stage(&self) -> Stage {
        Stage::Comment
    }

    async fn process(&self, input: &StageInput) -> Result<Payload, ProcessError> {
        let categorized = input
            .as_categorized()
            .ok_or_else(|| expected(Stage::Comment, input))?;
        let context = self.context(categorized).await?;
        let content = self.commentator.comment(&context).await?;
        checked(Payload::Commentary { content })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::UpstreamKey;
    use crate::model::MockModel;
    use crate::storage::{OpenStore, SqliteStore};
    use chrono::Utc;

    fn categorized(parsed_id: i64) -> CategorizedArticle {
        CategorizedArticle {
            id: 11,
            parsed_article_id: parsed_id,
            category: "science".into(),
            confidence: 0.75,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn lead_commentary_without_context() {
        let generator = CommentaryGenerator::new(Arc::new(LeadCommentator));
        let input = StageInput::Stored(Article::Categorized(categorized(1)));
        let payload = generator.process(&input).await.unwrap();
        assert_eq!(
            payload,
            Payload::Commentary { content: "Filed under science with 75% confidence.".into() }
        );
    }

    #[tokio::test]
    async fn commentary_reads_parsed_article_from_store() {
        let store: Arc<dyn ArticleStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .insert_if_absent(&UpstreamKey::Source("s1".into()), &Payload::Raw { payload: "x".into() })
            .await
            .unwrap();
        store
            .insert_if_absent(
                &UpstreamKey::Article(1),
                &Payload::Parsed { title: "Comet seen".into(), body: "It was bright.\n\nMore.".into() },
            )
            .await
            .unwrap();

        let generator = CommentaryGenerator::new(Arc::new(LeadCommentator)).with_store(store);
        let input = StageInput::Stored(Article::Categorized(categorized(1)));
        let payload = generator.process(&input).await.unwrap();
        assert_eq!(
            payload,
            Payload::Commentary { content: "[science, 75%] Comet seen: It was bright.".into() }
        );
    }

    #[tokio::test]
    async fn model_commentator_prompts_with_category() {
        let model = Arc::new(MockModel::replying("  A fine discovery.  "));
        let generator = CommentaryGenerator::new(Arc::new(ModelCommentator::new(model.clone())));
        let input = StageInput::Stored(Article::Categorized(categorized(1)));
        let payload = generator.process(&input).await.unwrap();
        assert_eq!(payload, Payload::Commentary { content: "A fine discovery.".into() });
        assert!(model.prompts()[0].contains("science news article"));
    }

    #[tokio::test]
    async fn empty_model_reply_is_malformed() {
        let generator = CommentaryGenerator::new(Arc::new(ModelCommentator::new(Arc::new(
            MockModel::replying("   "),
        ))));
        let input = StageInput::Stored(Article::Categorized(categorized(1)));
        assert!(matches!(
            generator.process(&input).await,
            Err(ProcessError::Malformed(_))
        ));
    }
}
