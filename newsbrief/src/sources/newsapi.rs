use chrono::NaiveDate;
use serde::Deserialize;

use super::{api_key, get_json, http_client, parse_timestamp, NewsSource};
use crate::article::{Article, ArticleBatch, Source};
use crate::error::Result;

pub const DEFAULT_URL: &str = "https://newsapi.org/v2/everything";

pub const DEFAULT_QUERY: &str = "(artificial intelligence OR machine learning OR AI OR technology OR software OR programming OR computer science OR data science OR robotics OR automation OR tech startup OR semiconductor OR chip OR quantum computing OR blockchain OR cryptocurrency OR cybersecurity OR cloud computing OR API OR algorithm OR neural network OR deep learning OR LLM OR GPT)";

pub const DEFAULT_DOMAINS: &[&str] = &[
    "techcrunch.com",
    "wired.com",
    "arstechnica.com",
    "theverge.com",
    "engadget.com",
    "venturebeat.com",
    "zdnet.com",
    "cnet.com",
    "ieee.org",
    "nature.com",
    "science.org",
];

/// NewsAPI `everything` endpoint, most popular English articles of the day.
pub struct NewsApiSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    query: String,
    domains: Vec<String>,
    page_size: u32,
}

impl NewsApiSource {
    pub fn new(api_key: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            base_url: DEFAULT_URL.to_string(),
            api_key: api_key.into(),
            query: DEFAULT_QUERY.to_string(),
            domains: DEFAULT_DOMAINS.iter().map(|d| d.to_string()).collect(),
            page_size: 50,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// `None` when the API key variable is not set.
    pub fn from_config(config: &common::NewsApiConfig, timeout_secs: u64) -> Result<Option<Self>> {
        let env_var = config.api_key_env.as_deref().unwrap_or("NEWSAPI_KEY");
        let Some(key) = api_key("NewsAPI", env_var) else {
            return Ok(None);
        };

        let mut source = Self::new(key, timeout_secs)?;
        if let Some(query) = &config.query {
            source.query = query.clone();
        }
        if let Some(domains) = &config.domains {
            source.domains = domains.clone();
        }
        if let Some(page_size) = config.page_size {
            source.page_size = page_size;
        }
        Ok(Some(source))
    }
}

#[derive(Debug, Deserialize)]
struct NewsApiResponse {
    #[serde(default)]
    articles: Vec<NewsApiArticle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewsApiArticle {
    source: Option<NewsApiOutlet>,
    title: Option<String>,
    url: Option<String>,
    published_at: Option<String>,
    description: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewsApiOutlet {
    name: Option<String>,
}

#[async_trait::async_trait]
impl NewsSource for NewsApiSource {
    fn name(&self) -> &str {
        "NewsAPI"
    }

    async fn fetch(&self, date: NaiveDate) -> Result<ArticleBatch> {
        let day = date.format("%Y-%m-%d").to_string();
        let page_size = self.page_size.to_string();
        let domains = self.domains.join(",");

        let request = self.client.get(&self.base_url).query(&[
            ("q", self.query.as_str()),
            ("from", day.as_str()),
            ("to", day.as_str()),
            ("sortBy", "popularity"),
            ("language", "en"),
            ("pageSize", page_size.as_str()),
            ("apiKey", self.api_key.as_str()),
            ("domains", domains.as_str()),
        ]);
        let response: NewsApiResponse = get_json(request).await?;

        let articles = response
            .articles
            .into_iter()
            .map(|a| {
                let description = a
                    .description
                    .filter(|d| !d.trim().is_empty())
                    .or(a.content)
                    .unwrap_or_default();
                let outlet = a
                    .source
                    .and_then(|s| s.name)
                    .unwrap_or_else(|| "Unknown".to_string());
                Article {
                    title: a.title.unwrap_or_default(),
                    url: a.url.unwrap_or_default(),
                    published_at: parse_timestamp(a.published_at.as_deref(), date),
                    source: Source::NewsApi(outlet),
                    description,
                }
            })
            .collect();

        Ok(ArticleBatch::new(date, articles))
    }
}
