//! Article records and the date-keyed artifact store shared by every stage.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::sources::parse_timestamp;

/// Where an article came from. Stored in artifacts as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Source {
    /// NewsAPI, tagged with the outlet name it reported
    NewsApi(String),
    Guardian,
    /// RSS, tagged with the feed title
    Rss(String),
    Other(String),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::NewsApi(outlet) => write!(f, "NewsAPI - {}", outlet),
            Source::Guardian => f.write_str("The Guardian"),
            Source::Rss(feed) => write!(f, "RSS - {}", feed),
            Source::Other(label) => f.write_str(label),
        }
    }
}

impl From<String> for Source {
    fn from(s: String) -> Self {
        if let Some(outlet) = s.strip_prefix("NewsAPI - ") {
            Source::NewsApi(outlet.to_string())
        } else if let Some(feed) = s.strip_prefix("RSS - ") {
            Source::Rss(feed.to_string())
        } else if s == "The Guardian" {
            Source::Guardian
        } else {
            Source::Other(s)
        }
    }
}

impl From<Source> for String {
    fn from(s: Source) -> Self {
        s.to_string()
    }
}

/// One ingested news item. `url` is its identity within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    pub source: Source,
    #[serde(default)]
    pub description: String,
}

/// A batch record as found on disk. Other fetchers write RFC 2822 dates, or an empty
/// string when the feed had none.
#[derive(Debug, Deserialize)]
struct StoredArticle {
    title: String,
    url: String,
    #[serde(default)]
    published_at: Option<String>,
    source: Source,
    #[serde(default)]
    description: String,
}

impl StoredArticle {
    fn into_article(self, date: NaiveDate) -> Article {
        Article {
            published_at: parse_timestamp(self.published_at.as_deref(), date),
            title: self.title,
            url: self.url,
            source: self.source,
            description: self.description,
        }
    }
}

/// Ordered articles for a single date.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleBatch {
    pub date: NaiveDate,
    articles: Vec<Article>,
}

impl ArticleBatch {
    pub fn new(date: NaiveDate, articles: Vec<Article>) -> Self {
        Self { date, articles }
    }

    pub fn empty(date: NaiveDate) -> Self {
        Self::new(date, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.articles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }

    pub fn articles(&self) -> &[Article] {
        &self.articles
    }

    pub fn get(&self, index: usize) -> Option<&Article> {
        self.articles.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Article> {
        self.articles.iter()
    }

    pub fn into_articles(self) -> Vec<Article> {
        self.articles
    }
}

/// An article chosen by the selector, tagged with the topic it was scored under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedArticle {
    #[serde(flatten)]
    pub article: Article,
    pub topic: String,
}

/// A selected article enriched by the summarizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizedArticle {
    #[serde(flatten)]
    pub selected: SelectedArticle,
    pub summary: String,
    #[serde(default)]
    pub bullets: Vec<String>,
}

/// The per-date JSON artifacts written by the pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    Raw,
    Dedup,
    Select,
    Summary,
}

impl ArtifactKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ArtifactKind::Raw => "raw",
            ArtifactKind::Dedup => "dedup",
            ArtifactKind::Select => "select",
            ArtifactKind::Summary => "summary",
        }
    }

    pub fn file_name(&self, date: NaiveDate) -> String {
        format!("{}_{}.json", self.prefix(), date.format("%Y-%m-%d"))
    }
}

/// Reads and writes `{kind}_{date}.json` files under one directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, kind: ArtifactKind, date: NaiveDate) -> PathBuf {
        self.root.join(kind.file_name(date))
    }

    pub fn exists(&self, kind: ArtifactKind, date: NaiveDate) -> bool {
        self.path(kind, date).is_file()
    }

    pub async fn load<T: DeserializeOwned>(&self, kind: ArtifactKind, date: NaiveDate) -> Result<T> {
        let path = self.path(kind, date);
        let data = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| PipelineError::artifact(&path, e))?;
        serde_json::from_str(&data).map_err(|e| PipelineError::artifact(&path, e))
    }

    /// Write the artifact atomically: a crash mid-write leaves the previous file intact.
    pub async fn save<T: Serialize + ?Sized>(
        &self,
        kind: ArtifactKind,
        date: NaiveDate,
        value: &T,
    ) -> Result<PathBuf> {
        let path = self.path(kind, date);
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| PipelineError::artifact(&self.root, e))?;

        let json = serde_json::to_string_pretty(value).map_err(|e| PipelineError::artifact(&path, e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| PipelineError::artifact(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| PipelineError::artifact(&path, e))?;

        debug!(path = %path.display(), "artifact written");
        Ok(path)
    }

    /// Load an article batch, rejecting records without a title or url. Missing or
    /// unparseable timestamps become midnight UTC of `date`.
    pub async fn load_batch(&self, kind: ArtifactKind, date: NaiveDate) -> Result<ArticleBatch> {
        let stored: Vec<StoredArticle> = self.load(kind, date).await?;
        let articles: Vec<Article> = stored.into_iter().map(|a| a.into_article(date)).collect();
        if let Some(pos) = articles
            .iter()
            .position(|a| a.title.trim().is_empty() || a.url.trim().is_empty())
        {
            return Err(PipelineError::artifact(
                self.path(kind, date),
                format!("record {} has an empty title or url", pos),
            ));
        }
        Ok(ArticleBatch::new(date, articles))
    }

    pub async fn save_batch(&self, kind: ArtifactKind, batch: &ArticleBatch) -> Result<PathBuf> {
        self.save(kind, batch.date, batch.articles()).await
    }
}
