use chrono::NaiveDate;
use feed_rs::model::{Entry, Feed};
use feed_rs::parser;
use tracing::{debug, warn};

use super::{http_client, send, strip_html, NewsSource};
use crate::article::{Article, ArticleBatch, Source};
use crate::error::{PipelineError, Result};

pub const DEFAULT_FEEDS: &[&str] = &[
    "https://feeds.bbci.co.uk/news/technology/rss.xml",
    "https://techcrunch.com/feed/",
    "https://www.theverge.com/rss/index.xml",
    "https://feeds.arstechnica.com/arstechnica/technology-lab",
    "https://www.wired.com/feed/rss",
    "https://venturebeat.com/feed/",
    "https://www.engadget.com/rss.xml",
    "https://www.nature.com/subjects/computer-science.rss",
    "https://www.science.org/rss/news_current.xml",
];

#[derive(Debug, Clone)]
pub struct FeedSpec {
    pub url: String,
    /// Overrides the title the feed reports about itself
    pub title: Option<String>,
}

/// A fixed list of RSS/Atom feeds.
pub struct RssSource {
    client: reqwest::Client,
    feeds: Vec<FeedSpec>,
    per_feed_limit: usize,
    date_tolerance_days: i64,
}

impl RssSource {
    pub fn new(feeds: Vec<FeedSpec>, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            feeds,
            per_feed_limit: 20,
            date_tolerance_days: 1,
        })
    }

    pub fn from_config(config: &common::RssConfig, timeout_secs: u64) -> Result<Self> {
        let feeds = if config.feeds.is_empty() {
            DEFAULT_FEEDS
                .iter()
                .map(|url| FeedSpec {
                    url: url.to_string(),
                    title: None,
                })
                .collect()
        } else {
            config
                .feeds
                .iter()
                .map(|f| FeedSpec {
                    url: f.url.clone(),
                    title: f.title.clone(),
                })
                .collect()
        };

        let mut source = Self::new(feeds, timeout_secs)?;
        if let Some(limit) = config.per_feed_limit {
            source.per_feed_limit = limit;
        }
        if let Some(days) = config.date_tolerance_days {
            source.date_tolerance_days = days;
        }
        Ok(source)
    }

    async fn fetch_feed(&self, url: &str) -> Result<Feed> {
        let response = send(self.client.get(url)).await?;
        let bytes = response.bytes().await?;
        parser::parse(bytes.as_ref()).map_err(|e| PipelineError::Rejected(format!("failed to parse feed {}: {}", url, e)))
    }

    fn convert(&self, feed: Feed, spec: &FeedSpec, date: NaiveDate) -> Vec<Article> {
        let feed_title = spec
            .title
            .clone()
            .or_else(|| feed.title.as_ref().map(|t| t.content.trim().to_string()))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());

        feed.entries
            .into_iter()
            .take(self.per_feed_limit)
            .filter_map(|entry| self.convert_entry(entry, &feed_title, date))
            .collect()
    }

    fn convert_entry(&self, entry: Entry, feed_title: &str, date: NaiveDate) -> Option<Article> {
        let published = entry.published.or(entry.updated)?;
        let distance = (published.date_naive() - date).num_days().abs();
        if distance > self.date_tolerance_days {
            return None;
        }

        let description = entry
            .summary
            .as_ref()
            .map(|s| s.content.clone())
            .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
            .map(|html| strip_html(&html))
            .unwrap_or_default();

        Some(Article {
            title: entry.title.map(|t| t.content).unwrap_or_default(),
            url: entry.links.first().map(|l| l.href.clone()).unwrap_or_default(),
            published_at: published,
            source: Source::Rss(feed_title.to_string()),
            description,
        })
    }
}

#[async_trait::async_trait]
impl NewsSource for RssSource {
    fn name(&self) -> &str {
        "RSS"
    }

    async fn fetch(&self, date: NaiveDate) -> Result<ArticleBatch> {
        let mut articles = Vec::new();
        let mut last_error = None;
        let mut fetched_feeds = 0;

        for spec in &self.feeds {
            match self.fetch_feed(&spec.url).await {
                Ok(feed) => {
                    let items = self.convert(feed, spec, date);
                    debug!("RSS feed {}: {} entries within date range", spec.url, items.len());
                    articles.extend(items);
                    fetched_feeds += 1;
                }
                Err(e) => {
                    warn!("Failed to fetch RSS feed {}: {}", spec.url, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if fetched_feeds == 0 => Err(e),
            _ => Ok(ArticleBatch::new(date, articles)),
        }
    }
}
