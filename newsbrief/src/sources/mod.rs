//! News sources and the Fetch stage that combines them.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::article::{Article, ArticleBatch};
use crate::error::{PipelineError, Result};
use crate::retry::RetryPolicy;

pub mod filter;
pub mod guardian;
pub mod newsapi;
pub mod rss;

pub use guardian::GuardianSource;
pub use newsapi::NewsApiSource;
pub use rss::RssSource;

/// Descriptions are cut to this many characters
pub const MAX_DESCRIPTION_CHARS: usize = 200;

const USER_AGENT: &str = "newsbrief/0.1.0";

#[async_trait::async_trait]
pub trait NewsSource: Send + Sync {
    fn name(&self) -> &str;

    /// Articles published on `date`, in the order the source reports them
    async fn fetch(&self, date: NaiveDate) -> Result<ArticleBatch>;
}

/// Runs every configured source and merges their output.
pub struct Fetcher {
    sources: Vec<Arc<dyn NewsSource>>,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(sources: Vec<Arc<dyn NewsSource>>, retry: RetryPolicy) -> Self {
        Self { sources, retry }
    }

    /// Build the enabled sources. Sources whose API key is missing are skipped.
    pub fn from_config(config: &common::Config, retry: RetryPolicy) -> Result<Self> {
        let timeout = config.fetch_timeout_seconds();
        let sources_cfg = config.sources.clone().unwrap_or_default();
        let mut sources: Vec<Arc<dyn NewsSource>> = Vec::new();

        let newsapi = sources_cfg.newsapi.unwrap_or_default();
        if newsapi.enabled.unwrap_or(true) {
            if let Some(source) = NewsApiSource::from_config(&newsapi, timeout)? {
                sources.push(Arc::new(source));
            }
        }

        let guardian = sources_cfg.guardian.unwrap_or_default();
        if guardian.enabled.unwrap_or(true) {
            if let Some(source) = GuardianSource::from_config(&guardian, timeout)? {
                sources.push(Arc::new(source));
            }
        }

        let rss = sources_cfg.rss.unwrap_or_default();
        if rss.enabled.unwrap_or(true) {
            sources.push(Arc::new(RssSource::from_config(&rss, timeout)?));
        }

        Ok(Self::new(sources, retry))
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Fetch from every source in order. A failing source is skipped; the stage only fails
    /// when every source failed.
    pub async fn fetch_all(&self, date: NaiveDate) -> Result<ArticleBatch> {
        if self.sources.is_empty() {
            return Err(PipelineError::Config("no news sources enabled".into()));
        }

        let mut articles = Vec::new();
        let mut last_error = None;
        let mut succeeded = 0;

        for source in &self.sources {
            let label = format!("fetch {}", source.name());
            match self.retry.run(&label, |_| source.fetch(date)).await {
                Ok(batch) => {
                    let fetched = batch.len();
                    let kept: Vec<Article> = batch.into_articles().into_iter().filter_map(clean).collect();
                    info!("{}: {} articles ({} relevant)", source.name(), fetched, kept.len());
                    articles.extend(kept);
                    succeeded += 1;
                }
                Err(e) => {
                    warn!("Failed to fetch from {}: {}", source.name(), e);
                    last_error = Some(e);
                }
            }
        }

        if succeeded == 0 {
            let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
            return Err(PipelineError::Service(anyhow::anyhow!(
                "all {} sources failed, last error: {}",
                self.sources.len(),
                reason
            )));
        }

        info!("Total valid articles: {}", articles.len());
        Ok(ArticleBatch::new(date, articles))
    }
}

/// Drop incomplete or off-topic articles and bound the description length.
fn clean(mut article: Article) -> Option<Article> {
    article.title = article.title.trim().to_string();
    article.url = article.url.trim().to_string();
    if article.title.is_empty() || !is_web_link(&article.url) {
        return None;
    }
    article.description = truncate_chars(article.description.trim(), MAX_DESCRIPTION_CHARS);
    filter::is_relevant(&article.title, &article.description).then_some(article)
}

fn is_web_link(raw: &str) -> bool {
    Url::parse(raw).map_or(false, |u| matches!(u.scheme(), "http" | "https") && u.has_host())
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Plain text of an HTML fragment on a single line.
pub(crate) fn strip_html(html: &str) -> String {
    let text = html2text::from_read(html.as_bytes(), 1000).unwrap_or_else(|_| html.to_string());
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Read the API key named by `env_var`; `None` (with a warning) when it is unset.
pub(crate) fn api_key(source: &str, env_var: &str) -> Option<String> {
    match std::env::var(env_var) {
        Ok(key) if !key.trim().is_empty() => Some(key),
        _ => {
            warn!("{} not found in environment, skipping {}", env_var, source);
            None
        }
    }
}

/// Send a request and classify the response: 5xx and 429 are transient, other
/// non-success statuses are rejected outright.
pub(crate) async fn send(request: RequestBuilder) -> Result<reqwest::Response> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let body = truncate_chars(&body, 200);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(PipelineError::Service(anyhow::anyhow!("server error: {} {}", status, body)))
    } else {
        Err(PipelineError::Rejected(format!("{} {}", status, body)))
    }
}

pub(crate) async fn get_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    let response = send(request).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| PipelineError::Service(anyhow::Error::new(e).context("failed to decode response")))
}

/// RFC 3339 or RFC 2822 timestamp, falling back to midnight UTC of `date`.
pub(crate) fn parse_timestamp(raw: Option<&str>, date: NaiveDate) -> DateTime<Utc> {
    raw.map(str::trim)
        .and_then(|s| DateTime::parse_from_rfc3339(s).or_else(|_| DateTime::parse_from_rfc2822(s)).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::fixtures::{article, date};
    use crate::article::Source;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakySource {
        name: &'static str,
        failures: usize,
        calls: AtomicUsize,
        titles: Vec<&'static str>,
    }

    #[async_trait::async_trait]
    impl NewsSource for FlakySource {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch(&self, date: NaiveDate) -> Result<ArticleBatch> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(PipelineError::Service(anyhow::anyhow!("503 Service Unavailable")));
            }
            let articles = self
                .titles
                .iter()
                .enumerate()
                .map(|(i, t)| article(t, &format!("https://{}/{}", self.name, i)))
                .collect();
            Ok(ArticleBatch::new(date, articles))
        }
    }

    fn source(name: &'static str, failures: usize, titles: &[&'static str]) -> Arc<FlakySource> {
        Arc::new(FlakySource {
            name,
            failures,
            calls: AtomicUsize::new(0),
            titles: titles.to_vec(),
        })
    }

    #[tokio::test]
    async fn merges_sources_in_order_and_filters() {
        let a = source("a", 0, &["OpenAI launches GPT-5", "Celebrity fashion week"]);
        let b = source("b", 0, &["NVIDIA unveils chips"]);
        let fetcher = Fetcher::new(vec![a as Arc<dyn NewsSource>, b], RetryPolicy::immediate(3));

        let batch = fetcher.fetch_all(date()).await.unwrap();
        let titles: Vec<_> = batch.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["OpenAI launches GPT-5", "NVIDIA unveils chips"]);
    }

    #[tokio::test]
    async fn source_recovers_on_third_attempt() {
        let flaky = source("flaky", 2, &["Rust software release"]);
        let fetcher = Fetcher::new(vec![flaky.clone() as Arc<dyn NewsSource>], RetryPolicy::immediate(3));
        let batch = fetcher.fetch_all(date()).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failing_source_is_skipped() {
        let down = source("down", usize::MAX, &[]);
        let up = source("up", 0, &["Apple ships M4 iPad"]);
        let fetcher = Fetcher::new(vec![down as Arc<dyn NewsSource>, up], RetryPolicy::immediate(2));
        let batch = fetcher.fetch_all(date()).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn all_sources_failing_is_transient() {
        let fetcher = Fetcher::new(
            vec![
                source("x", usize::MAX, &[]) as Arc<dyn NewsSource>,
                source("y", usize::MAX, &[]),
            ],
            RetryPolicy::immediate(2),
        );
        let err = fetcher.fetch_all(date()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn no_sources_is_a_config_error() {
        let fetcher = Fetcher::new(Vec::new(), RetryPolicy::immediate(1));
        let err = fetcher.fetch_all(date()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn clean_drops_incomplete_and_truncates() {
        let mut a = article("Software update", "  ");
        assert!(clean(a.clone()).is_none());

        a.url = "https://example.com/x".into();
        a.description = "x".repeat(500);
        a.source = Source::Guardian;
        let cleaned = clean(a).unwrap();
        assert_eq!(cleaned.description.chars().count(), MAX_DESCRIPTION_CHARS);
    }

    #[test]
    fn clean_requires_a_web_link() {
        assert!(clean(article("Software update", "/relative/path")).is_none());
        assert!(clean(article("Software update", "mailto:news@example.com")).is_none());
        assert!(clean(article("Software update", " https://example.com/a ")).is_some());
    }

    #[test]
    fn strips_markup() {
        assert_eq!(
            strip_html("<p>Apple <span>ships</span>\n the M4 iPad</p>"),
            "Apple ships the M4 iPad"
        );
    }

    #[test]
    fn timestamp_fallback_is_midnight() {
        let ts = parse_timestamp(Some("2025-07-25T09:30:00+02:00"), date());
        assert_eq!(ts.to_rfc3339(), "2025-07-25T07:30:00+00:00");
        let ts = parse_timestamp(Some("Fri, 25 Jul 2025 08:00:00 +0000"), date());
        assert_eq!(ts.to_rfc3339(), "2025-07-25T08:00:00+00:00");
        let ts = parse_timestamp(Some("yesterday"), date());
        assert_eq!(ts.to_rfc3339(), "2025-07-25T00:00:00+00:00");
        let ts = parse_timestamp(Some(""), date());
        assert_eq!(ts.to_rfc3339(), "2025-07-25T00:00:00+00:00");
    }
}
