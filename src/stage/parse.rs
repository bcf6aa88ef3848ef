//! Parse stage: extract title and body text from raw payloads
//!
//! Markdown and plain text go through pulldown-cmark; documents that open
//! with a tag, and HTML embedded in markdown, are rendered to text with
//! html2text. Either way the first heading (or the HTML `<title>`) becomes
//! the title and the remaining blocks the body.

use super::traits::{checked, expected, truncate_chars, ProcessError, Processor};
use crate::article::{Payload, Stage, StageInput};
use async_trait::async_trait;
use html2text::render::text_renderer::TrivialDecorator;
use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use std::sync::Arc;

const TITLE_FALLBACK_CHARS: usize = 120;

/// Title and body pulled out of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub title: String,
    pub body: String,
}

/// Turns a raw document into title and body text.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, raw: &str) -> Result<Extracted, ProcessError>;
}

/// Extractor for markdown, plain text and simple HTML documents.
#[derive(Debug, Default, Clone)]
pub struct MarkdownExtractor;

impl MarkdownExtractor {
    pub fn new() -> Self {
        Self
    }

    fn blocks(raw: &str) -> (Option<String>, Vec<String>) {
        if looks_like_html(raw) {
            return html_blocks(raw);
        }

        let mut title: Option<String> = None;
        let mut blocks = Vec::new();
        let mut heading = String::new();
        let mut in_heading = false;
        let mut in_code_block = false;
        let mut current = String::new();

        for event in Parser::new_ext(raw, Options::ENABLE_STRIKETHROUGH) {
            match event {
                Event::Start(Tag::Heading { .. }) => {
                    flush(&mut current, &mut blocks);
                    in_heading = true;
                    heading.clear();
                }
                Event::End(TagEnd::Heading(_)) => {
                    in_heading = false;
                    let text = collapse(&heading);
                    if text.is_empty() {
                        continue;
                    }
                    if title.is_none() {
                        title = Some(text);
                    } else {
                        blocks.push(text);
                    }
                }
                Event::Start(Tag::CodeBlock(_)) => in_code_block = true,
                Event::End(TagEnd::CodeBlock) => {
                    in_code_block = false;
                    flush(&mut current, &mut blocks);
                }
                Event::End(
                    TagEnd::Paragraph | TagEnd::Item | TagEnd::BlockQuote | TagEnd::HtmlBlock,
                ) => {
                    flush(&mut current, &mut blocks);
                }
                Event::Text(text) | Event::Code(text) => {
                    if in_heading {
                        heading.push_str(&text);
                    } else if !in_code_block {
                        current.push_str(&text);
                    }
                }
                Event::SoftBreak | Event::HardBreak => {
                    if in_heading {
                        heading.push(' ');
                    } else {
                        current.push(' ');
                    }
                }
                Event::Html(html) => {
                    let (html_title, text_blocks) = html_blocks(&html);
                    if title.is_none() {
                        title = html_title;
                    }
                    current.push_str(&text_blocks.join(" "));
                    current.push(' ');
                }
                Event::InlineHtml(html) => current.push_str(&html_text(&html)),
                _ => {}
            }
        }
        flush(&mut current, &mut blocks);
        (title, blocks)
    }
}

impl TextExtractor for MarkdownExtractor {
    fn extract(&self, raw: &str) -> Result<Extracted, ProcessError> {
        let (title, blocks) = Self::blocks(raw);
        let body = blocks.join("\n\n");
        if body.trim().is_empty() {
            return Err(ProcessError::Malformed("no body text found".to_string()));
        }
        let title = title.unwrap_or_else(|| fallback_title(&body));
        Ok(Extracted { title, body })
    }
}

fn flush(current: &mut String, blocks: &mut Vec<String>) {
    let text = collapse(current);
    if !text.is_empty() {
        blocks.push(text);
    }
    current.clear();
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First sentence of the body, capped.
fn fallback_title(body: &str) -> String {
    let first_line = body.lines().next().unwrap_or_default();
    let sentence = match first_line.find(". ") {
        Some(end) => &first_line[..end],
        None => first_line.trim_end_matches('.'),
    };
    truncate_chars(sentence, TITLE_FALLBACK_CHARS).trim().to_string()
}

fn looks_like_html(raw: &str) -> bool {
    let start = raw.trim_start();
    start.starts_with('<')
        && start[1..]
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '!')
            .unwrap_or(false)
}

/// Wide enough that html2text never wraps a paragraph.
const RENDER_WIDTH: usize = 1_000;

const HEADINGS: &[&str] = &["h1", "h2", "h3", "h4", "h5", "h6"];

/// Plain text of an HTML fragment. Entities are decoded; script and style
/// content is dropped.
fn html_text(html: &str) -> String {
    html2text::from_read_with_decorator(html.as_bytes(), RENDER_WIDTH, TrivialDecorator::new())
}

/// Inner HTML of the first element named one of `names`.
fn first_element<'a>(html: &'a str, names: &[&str]) -> Option<&'a str> {
    let lower = html.to_ascii_lowercase();
    let (open, name) = names
        .iter()
        .filter_map(|name| find_open_tag(&lower, name).map(|at| (at, *name)))
        .min_by_key(|(at, _)| *at)?;
    let content = open + lower[open..].find('>')? + 1;
    let end = content + lower[content..].find(&format!("</{}", name))?;
    Some(&html[content..end])
}

fn find_open_tag(lower: &str, name: &str) -> Option<usize> {
    let needle = format!("<{}", name);
    lower.match_indices(&needle).map(|(at, _)| at).find(|at| {
        lower[at + needle.len()..]
            .chars()
            .next()
            .map(|c| c == '>' || c == '/' || c.is_ascii_whitespace())
            .unwrap_or(false)
    })
}

/// Title and text blocks of an HTML document or fragment.
///
/// `<title>` wins over the first `<h1>`..`<h6>`. The block repeating the
/// title is left out of the body.
fn html_blocks(raw: &str) -> (Option<String>, Vec<String>) {
    let title = first_element(raw, &["title"])
        .or_else(|| first_element(raw, HEADINGS))
        .map(|inner| collapse(&html_text(inner)))
        .filter(|t| !t.is_empty());

    let mut blocks = Vec::new();
    let mut current = String::new();
    for line in html_text(raw).lines() {
        if line.trim().is_empty() {
            flush(&mut current, &mut blocks);
        } else {
            current.push_str(line);
            current.push(' ');
        }
    }
    flush(&mut current, &mut blocks);

    if let Some(title) = &title {
        if let Some(at) = blocks.iter().position(|b| b == title) {
            blocks.remove(at);
        }
    }
    (title, blocks)
}

/// Parse processor: raw article to title and body.
pub struct ArticleParser {
    extractor: Arc<dyn TextExtractor>,
}

impl ArticleParser {
    pub fn new(extractor: Arc<dyn TextExtractor>) -> Self {
        Self { extractor }
    }
}

impl Default for ArticleParser {
    fn default() -> Self {
        Self::new(Arc::new(MarkdownExtractor::new()))
    }
}

#[async_trait]
impl Processor for ArticleParser {
    fn id(&self) -> &str {
        "article-parser"
    }

    fn stage(&self) -> Stage {
        Stage::Parse
    }

    async fn process(&self, input: &StageInput) -> Result<Payload, ProcessError> {
        let raw = input.as_raw().ok_or_else(|| expected(Stage::Parse, input))?;
        let extracted = self.extractor.extract(&raw.payload)?;
        checked(Payload::Parsed {
            title: extracted.title,
            body: extracted.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::{Article, RawArticle};
    use chrono::Utc;

    fn extract(raw: &str) -> Extracted {
        MarkdownExtractor::new().extract(raw).unwrap()
    }

    #[test]
    fn markdown_heading_becomes_title() {
        let doc = extract("# Rates rise again\n\nThe central bank moved.\n\nMarkets shrugged.");
        assert_eq!(doc.title, "Rates rise again");
        assert_eq!(doc.body, "The central bank moved.\n\nMarkets shrugged.");
    }

    #[test]
    fn later_headings_stay_in_body() {
        let doc = extract("# Main\n\nIntro.\n\n## Background\n\nDetails with `code`.");
        assert_eq!(doc.title, "Main");
        assert!(doc.body.contains("Background"));
        assert!(doc.body.contains("Details with code."));
    }

    #[test]
    fn html_document_uses_title_tag_and_strips_markup() {
        let doc = extract(
            "<html><head><title>Storm &amp; Flood</title><style>p{}</style></head>\
             <body><h1>Storm</h1><p>Rain fell.</p><script>x()</script><p>Rivers rose.</p></body></html>",
        );
        assert_eq!(doc.title, "Storm & Flood");
        assert!(doc.body.contains("Rain fell."));
        assert!(doc.body.contains("Rivers rose."));
        assert!(!doc.body.contains("x()"));
        assert!(!doc.body.contains("p{}"));
    }

    #[test]
    fn html_heading_without_title_tag() {
        let doc = extract("<h1>Story</h1><p>Body</p>");
        assert_eq!(doc.title, "Story");
        assert_eq!(doc.body, "Body");
    }

    #[test]
    fn html_entities_are_decoded() {
        let doc = extract("<h1>Rates</h1><p>It&#8217;s &mdash; a &euro;5 move</p>");
        assert_eq!(doc.title, "Rates");
        assert_eq!(doc.body, "It\u{2019}s \u{2014} a \u{20ac}5 move");
    }

    #[test]
    fn html_block_inside_markdown_is_rendered() {
        let doc = extract("# Budget\n\n<div>Spending &amp; cuts</div>\n\nVote due <b>Friday</b>.");
        assert_eq!(doc.title, "Budget");
        assert!(doc.body.contains("Spending & cuts"));
        assert!(doc.body.contains("Friday"));
        assert!(!doc.body.contains('<'));
    }

    #[test]
    fn plain_text_falls_back_to_first_sentence() {
        let doc = extract("Officials confirmed the deal. More to follow.");
        assert_eq!(doc.title, "Officials confirmed the deal");
        assert_eq!(doc.body, "Officials confirmed the deal. More to follow.");
    }

    #[test]
    fn heading_only_document_is_malformed() {
        let err = MarkdownExtractor::new().extract("# Just a title").unwrap_err();
        assert!(matches!(err, ProcessError::Malformed(_)));
        let err = MarkdownExtractor::new().extract("<p>  </p>").unwrap_err();
        assert!(matches!(err, ProcessError::Malformed(_)));
    }

    #[tokio::test]
    async fn parser_processes_raw_articles_only() {
        let parser = ArticleParser::default();
        let raw = StageInput::Stored(Article::Raw(RawArticle {
            id: 1,
            source_id: "s".into(),
            payload: "# T\n\nBody text.".into(),
            created_at: Utc::now(),
        }));
        let payload = parser.process(&raw).await.unwrap();
        assert_eq!(
            payload,
            Payload::Parsed { title: "T".into(), body: "Body text.".into() }
        );

        let wrong = StageInput::Fetched(crate::article::FetchedItem::new("s", "# T"));
        assert!(matches!(
            parser.process(&wrong).await,
            Err(ProcessError::InvalidInput(_))
        ));
    }
}
