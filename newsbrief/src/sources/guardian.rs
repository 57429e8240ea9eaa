use chrono::NaiveDate;
use serde::Deserialize;

use super::{api_key, get_json, http_client, parse_timestamp, strip_html, NewsSource};
use crate::article::{Article, ArticleBatch, Source};
use crate::error::Result;

pub const DEFAULT_URL: &str = "https://content.guardianapis.com/search";

pub const DEFAULT_QUERY: &str = "artificial intelligence OR AI OR machine learning OR technology OR software OR programming OR robotics OR automation OR tech OR startup OR cybersecurity OR quantum OR blockchain OR data science";

/// The Guardian content API, technology and science sections.
pub struct GuardianSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    query: String,
    section: String,
    page_size: u32,
}

impl GuardianSource {
    pub fn new(api_key: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            base_url: DEFAULT_URL.to_string(),
            api_key: api_key.into(),
            query: DEFAULT_QUERY.to_string(),
            section: "technology|science".to_string(),
            page_size: 50,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn from_config(config: &common::GuardianConfig, timeout_secs: u64) -> Result<Option<Self>> {
        let env_var = config.api_key_env.as_deref().unwrap_or("GUARDIAN_API_KEY");
        let Some(key) = api_key("The Guardian", env_var) else {
            return Ok(None);
        };

        let mut source = Self::new(key, timeout_secs)?;
        if let Some(query) = &config.query {
            source.query = query.clone();
        }
        if let Some(section) = &config.section {
            source.section = section.clone();
        }
        if let Some(page_size) = config.page_size {
            source.page_size = page_size;
        }
        Ok(Some(source))
    }
}

#[derive(Debug, Deserialize)]
struct GuardianEnvelope {
    response: GuardianResponse,
}

#[derive(Debug, Deserialize)]
struct GuardianResponse {
    #[serde(default)]
    results: Vec<GuardianResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuardianResult {
    web_title: Option<String>,
    web_url: Option<String>,
    web_publication_date: Option<String>,
    #[serde(default)]
    fields: GuardianFields,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuardianFields {
    headline: Option<String>,
    trail_text: Option<String>,
}

#[async_trait::async_trait]
impl NewsSource for GuardianSource {
    fn name(&self) -> &str {
        "The Guardian"
    }

    async fn fetch(&self, date: NaiveDate) -> Result<ArticleBatch> {
        let day = date.format("%Y-%m-%d").to_string();
        let page_size = self.page_size.to_string();

        let request = self.client.get(&self.base_url).query(&[
            ("from-date", day.as_str()),
            ("to-date", day.as_str()),
            ("order-by", "relevance"),
            ("show-fields", "headline,trailText"),
            ("page-size", page_size.as_str()),
            ("api-key", self.api_key.as_str()),
            ("section", self.section.as_str()),
            ("q", self.query.as_str()),
        ]);
        let envelope: GuardianEnvelope = get_json(request).await?;

        let articles = envelope
            .response
            .results
            .into_iter()
            .map(|r| {
                // trailText carries inline markup
                let description = strip_html(&r.fields.trail_text.unwrap_or_default());
                Article {
                    title: r.fields.headline.or(r.web_title).unwrap_or_default(),
                    url: r.web_url.unwrap_or_default(),
                    published_at: parse_timestamp(r.web_publication_date.as_deref(), date),
                    source: Source::Guardian,
                    description,
                }
            })
            .collect();

        Ok(ArticleBatch::new(date, articles))
    }
}
