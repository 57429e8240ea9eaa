//! OpenAI-compatible chat-completion and embedding client.

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::{LlmProvider, LlmRequest, LlmResponse, Summary, UsageMetadata};

pub const DEFAULT_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a professional technology news editor who writes concise, accurate summaries.";

/// Non-success status returned by the endpoint.
#[derive(Debug, Error)]
#[error("{endpoint} API error {status}: {body}")]
pub struct ApiStatusError {
    pub endpoint: &'static str,
    pub status: StatusCode,
    pub body: String,
}

impl ApiStatusError {
    /// Rate limiting and server errors may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        self.status.is_server_error() || self.status == StatusCode::TOO_MANY_REQUESTS
    }
}

/// The endpoint did not answer within the configured timeout.
#[derive(Debug, Error)]
#[error("{endpoint} request timed out after {}s", .timeout.as_secs())]
pub struct RequestTimeout {
    pub endpoint: &'static str,
    pub timeout: Duration,
}

/// Client for any endpoint speaking the OpenAI chat/embeddings protocol.
pub struct RemoteLlmProvider {
    chat_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    max_tokens: usize,
    temperature: f32,
    client: reqwest::Client,
}

impl RemoteLlmProvider {
    pub fn new(chat_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            chat_url: chat_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout: Duration::from_secs(30),
            max_tokens: 300,
            temperature: 0.3,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_defaults(mut self, timeout_secs: u64, max_tokens: usize, temperature: f32) -> Self {
        self.timeout = Duration::from_secs(timeout_secs);
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// Build a provider from an endpoint config, reading the API key from the named env var.
    pub fn from_config(config: &common::RemoteLlmConfig, default_model: &str) -> Result<Self> {
        let key_var = config.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
        let api_key = std::env::var(key_var).with_context(|| format!("LLM API key env var '{}' not set", key_var))?;

        Ok(Self::new(
            config.api_url.clone().unwrap_or_else(|| DEFAULT_CHAT_URL.to_string()),
            api_key,
            config.model.clone().unwrap_or_else(|| default_model.to_string()),
        )
        .with_defaults(
            config.timeout_seconds.unwrap_or(30),
            config.max_tokens.unwrap_or(300),
            config.temperature.unwrap_or(0.3),
        ))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// `.../v1/chat/completions` -> `.../v1/embeddings`
    fn embedding_url(&self) -> String {
        if self.chat_url.ends_with("/embeddings") {
            self.chat_url.clone()
        } else if let Some(base) = self.chat_url.strip_suffix("/chat/completions") {
            format!("{}/embeddings", base)
        } else if let Some(base) = self.chat_url.strip_suffix("/completions") {
            format!("{}/embeddings", base)
        } else {
            format!("{}/embeddings", self.chat_url.trim_end_matches('/'))
        }
    }

    /// POST a JSON body and return the raw response text. Non-success statuses become
    /// [`ApiStatusError`].
    async fn post<B: Serialize>(&self, endpoint: &'static str, url: &str, body: &B, timeout: Duration) -> Result<String> {
        let exchange = async {
            let response = self
                .client
                .post(url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await
                .with_context(|| format!("{} request to {} failed", endpoint, url))?;

            let status = response.status();
            let text = response.text().await.with_context(|| format!("failed to read {} response", endpoint))?;
            if !status.is_success() {
                return Err(ApiStatusError {
                    endpoint,
                    status,
                    body: text.chars().take(500).collect(),
                }
                .into());
            }
            Ok::<_, anyhow::Error>(text)
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| RequestTimeout { endpoint, timeout })?
    }
}

#[async_trait::async_trait]
impl LlmProvider for RemoteLlmProvider {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        let timeout = request.timeout_seconds.map(Duration::from_secs).unwrap_or(self.timeout);

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system {
            messages.push(Message::new("system", system));
        }
        messages.push(Message::new("user", request.prompt));

        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            temperature: request.temperature.unwrap_or(self.temperature),
        };
        let text = self.post("chat", &self.chat_url, &body, timeout).await?;
        let reply: ChatResponse = serde_json::from_str(&text).context("failed to parse chat completion")?;

        let choice = reply.choices.into_iter().next().context("chat completion has no choices")?;
        let usage = reply.usage.map(UsageMetadata::from).unwrap_or_default();
        debug!(model = %self.model, tokens = usage.total_tokens, "chat completion");

        Ok(LlmResponse {
            content: choice.message.content.trim().to_string(),
            usage,
            model: reply.model.unwrap_or_else(|| self.model.clone()),
        })
    }

    async fn summarize(&self, content: &str, language: &str, max_tokens: usize) -> Result<Summary> {
        let prompt = format!(
            r#"Summarize the following technology news item in {language}.

OUTPUT FORMAT (strict JSON):
{{
  "summary": "2-3 concise sentences conveying the key facts and their impact",
  "bullets": ["tag 1", "tag 2", "tag 3"]
}}

Requirements:
1. The summary must be accurate, neutral and easy to understand
2. Provide 3-5 short tags covering the technical field, company names and product types
3. Write both the summary and the tags in {language}

NEWS ITEM:
{content}
"#
        );

        let request = LlmRequest {
            system: Some(SUMMARY_SYSTEM_PROMPT.to_string()),
            max_tokens: Some(max_tokens),
            temperature: Some(0.3),
            ..LlmRequest::new(prompt)
        };
        let response = self.generate(request).await?;

        let (summary, bullets) = super::summarizer::parse_summary_response(&response.content)
            .with_context(|| format!("unparseable summary reply: {}", response.content))?;

        Ok(Summary {
            summary,
            bullets,
            usage: response.usage,
        })
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.embedding_url();
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let text = self.post("embedding", &url, &body, self.timeout).await?;

        // OpenAI shape, entries possibly out of order; some local servers return bare vectors
        if let Ok(mut reply) = serde_json::from_str::<EmbeddingResponse>(&text) {
            reply.data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
            return Ok(reply.data.into_iter().map(|d| d.embedding).collect());
        }
        serde_json::from_str::<Vec<Vec<f32>>>(&text)
            .with_context(|| format!("failed to parse embedding response from {}", url))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

impl Message {
    fn new(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Usage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

impl From<Usage> for UsageMetadata {
    fn from(u: Usage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_url_is_inferred_from_chat_url() {
        let p = RemoteLlmProvider::new("http://localhost:11434/v1/chat/completions", "k", "m");
        assert_eq!(p.embedding_url(), "http://localhost:11434/v1/embeddings");

        let p = RemoteLlmProvider::new("http://localhost:11434/v1/", "k", "m");
        assert_eq!(p.embedding_url(), "http://localhost:11434/v1/embeddings");

        let p = RemoteLlmProvider::new("http://host/v1/embeddings", "k", "m");
        assert_eq!(p.embedding_url(), "http://host/v1/embeddings");
    }

    #[test]
    fn only_outages_are_retryable() {
        let err = |status| ApiStatusError {
            endpoint: "chat",
            status,
            body: String::new(),
        };
        assert!(err(StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert!(err(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!err(StatusCode::UNAUTHORIZED).is_retryable());
        assert!(!err(StatusCode::BAD_REQUEST).is_retryable());
    }
}
