// Summarizer module
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::{LlmProvider, UsageMetadata};
use crate::article::SelectedArticle;
use crate::error::{PipelineError, Result};

/// Tags used when the model returns a summary without any
pub const DEFAULT_BULLETS: [&str; 2] = ["tech", "news"];

/// Summary text and tags for one selected article.
#[derive(Debug, Clone)]
pub struct ArticleSummary {
    pub summary: String,
    pub bullets: Vec<String>,
    pub usage: UsageMetadata,
}

/// Summarization collaborator used by the Summarize stage.
#[async_trait::async_trait]
pub trait ArticleSummarizer: Send + Sync {
    async fn summarize(&self, article: &SelectedArticle) -> Result<ArticleSummary>;
}

/// Summarizes through an [`LlmProvider`].
pub struct LlmArticleSummarizer {
    provider: Arc<dyn LlmProvider>,
    language: String,
    max_tokens: usize,
}

impl LlmArticleSummarizer {
    pub fn new(provider: Arc<dyn LlmProvider>, language: impl Into<String>) -> Self {
        Self {
            provider,
            language: language.into(),
            max_tokens: 300,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait::async_trait]
impl ArticleSummarizer for LlmArticleSummarizer {
    async fn summarize(&self, selected: &SelectedArticle) -> Result<ArticleSummary> {
        let article = &selected.article;
        let content = format!(
            "Title: {}\nDescription: {}\nSource: {}\nLink: {}",
            article.title, article.description, article.source, article.url
        );

        let summary = self
            .provider
            .summarize(&content, &self.language, self.max_tokens)
            .await
            .map_err(PipelineError::from_llm)?;

        info!(
            "Summarized: {} ({} bullets, {} tokens)",
            truncate(&article.title, 50),
            summary.bullets.len(),
            summary.usage.total_tokens
        );

        Ok(ArticleSummary {
            summary: summary.summary,
            bullets: summary.bullets,
            usage: summary.usage,
        })
    }
}

/// Stands in when the summarization endpoint could not be set up, so stages that never
/// summarize still run. Every call fails with a configuration error.
#[derive(Debug, Clone)]
pub struct UnconfiguredSummarizer {
    reason: String,
}

impl UnconfiguredSummarizer {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait::async_trait]
impl ArticleSummarizer for UnconfiguredSummarizer {
    async fn summarize(&self, _article: &SelectedArticle) -> Result<ArticleSummary> {
        Err(PipelineError::Config(self.reason.clone()))
    }
}

/// Offline summarizer: the article's own description, cut to a short excerpt.
#[derive(Debug, Clone)]
pub struct ExcerptSummarizer {
    max_chars: usize,
}

impl Default for ExcerptSummarizer {
    fn default() -> Self {
        Self { max_chars: 160 }
    }
}

#[async_trait::async_trait]
impl ArticleSummarizer for ExcerptSummarizer {
    async fn summarize(&self, selected: &SelectedArticle) -> Result<ArticleSummary> {
        let article = &selected.article;
        let source = if article.description.trim().is_empty() {
            article.title.trim()
        } else {
            article.description.trim()
        };
        Ok(ArticleSummary {
            summary: truncate(source, self.max_chars),
            bullets: DEFAULT_BULLETS.iter().map(|s| s.to_string()).collect(),
            usage: UsageMetadata::default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SummaryJson {
    summary: String,
    #[serde(default)]
    bullets: Vec<String>,
}

/// Parse a summarization reply: strict JSON first, then labelled lines
/// (`Summary:` / `摘要：` and `Tags:` / `标签：`).
pub fn parse_summary_response(content: &str) -> Option<(String, Vec<String>)> {
    let parsed = super::extract_json_from_text(content)
        .and_then(|json| serde_json::from_str::<SummaryJson>(&json).ok())
        .map(|s| (s.summary.trim().to_string(), clean_tags(s.bullets)))
        .filter(|(summary, _)| !summary.is_empty())
        .or_else(|| parse_labelled_lines(content))?;

    let (summary, mut bullets) = parsed;
    if bullets.is_empty() {
        bullets = DEFAULT_BULLETS.iter().map(|s| s.to_string()).collect();
    }
    Some((summary, bullets))
}

fn parse_labelled_lines(content: &str) -> Option<(String, Vec<String>)> {
    const SUMMARY_LABELS: [&str; 4] = ["摘要：", "摘要:", "Summary:", "summary:"];
    const TAG_LABELS: [&str; 6] = ["标签：", "标签:", "Tags:", "tags:", "Bullets:", "bullets:"];

    let mut summary = String::new();
    let mut bullets = Vec::new();
    let mut section = None;

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = strip_any(line, &SUMMARY_LABELS) {
            summary = rest.trim().to_string();
            section = Some("summary");
        } else if let Some(rest) = strip_any(line, &TAG_LABELS) {
            bullets = split_tags(rest);
            section = Some("bullets");
        } else if section == Some("summary") && summary.is_empty() {
            summary = line.to_string();
        } else if section == Some("bullets") && bullets.is_empty() {
            bullets = split_tags(line);
        }
    }

    if summary.is_empty() {
        // Any substantial unlabelled line will do
        summary = content
            .lines()
            .map(str::trim)
            .find(|l| l.chars().count() > 20 && !l.contains('：') && !l.contains(':'))?
            .to_string();
    }

    Some((summary, bullets))
}

fn strip_any<'a>(line: &'a str, labels: &[&str]) -> Option<&'a str> {
    labels.iter().find_map(|label| line.strip_prefix(*label))
}

fn split_tags(text: &str) -> Vec<String> {
    let sep = if text.contains('，') { '，' } else { ',' };
    clean_tags(text.split(sep).map(str::to_string).collect())
}

fn clean_tags(tags: Vec<String>) -> Vec<String> {
    tags.into_iter()
        .map(|t| t.trim().trim_matches(|c: char| c == '[' || c == ']').trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    }
}
