//! Title embedding models used by the dedup stage.
//!
//! A model is built once per run and shared; the dedup stage embeds the whole batch in a
//! single call. Every failure to produce vectors is reported as
//! [`PipelineError::EmbeddingUnavailable`], never as a service error.

use std::sync::Arc;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::llm::LlmProvider;

pub const DEFAULT_HASHING_DIMENSIONS: usize = 384;

#[async_trait::async_trait]
pub trait TitleEmbedder: Send + Sync {
    /// Model identifier for logs
    fn name(&self) -> &str;

    /// One vector per title, in input order, all of the same length
    async fn embed(&self, titles: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embeddings from an OpenAI-compatible `/embeddings` endpoint.
pub struct RemoteEmbedder {
    provider: Arc<dyn LlmProvider>,
    name: String,
}

impl RemoteEmbedder {
    pub fn new(provider: Arc<dyn LlmProvider>, name: impl Into<String>) -> Self {
        Self {
            provider,
            name: name.into(),
        }
    }
}

#[async_trait::async_trait]
impl TitleEmbedder for RemoteEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, titles: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = self
            .provider
            .embed(titles)
            .await
            .map_err(|e| PipelineError::EmbeddingUnavailable(format!("{}: {:#}", self.name, e)))?;
        check_vectors(titles.len(), vectors)
    }
}

/// AllMiniLM-L6-v2 run in-process. The model is loaded (and downloaded on first use) when
/// the embedder is built; inference runs on the blocking pool.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub const MODEL_NAME: &'static str = "all-MiniLM-L6-v2";

    pub fn load(cache_dir: Option<std::path::PathBuf>) -> Result<Self> {
        let mut options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
            .with_show_download_progress(false);
        if let Some(dir) = cache_dir {
            options = options.with_cache_dir(dir);
        }
        let model = fastembed::TextEmbedding::try_new(options)
            .map_err(|e| PipelineError::EmbeddingUnavailable(format!("{}: {:#}", Self::MODEL_NAME, e)))?;
        tracing::info!("Loaded embedding model {}", Self::MODEL_NAME);
        Ok(Self {
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait::async_trait]
impl TitleEmbedder for LocalEmbedder {
    fn name(&self) -> &str {
        Self::MODEL_NAME
    }

    async fn embed(&self, titles: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let input = titles.to_vec();
        let vectors = tokio::task::spawn_blocking(move || -> std::result::Result<Vec<Vec<f32>>, String> {
            let mut model = model.lock().map_err(|_| "model lock poisoned".to_string())?;
            model.embed(input, None).map_err(|e| format!("{:#}", e))
        })
        .await
        .map_err(|e| PipelineError::EmbeddingUnavailable(format!("{}: {}", Self::MODEL_NAME, e)))?
        .map_err(|e| PipelineError::EmbeddingUnavailable(format!("{}: {}", Self::MODEL_NAME, e)))?;
        check_vectors(titles.len(), vectors)
    }
}

/// Offline model: signed feature hashing of word and character-trigram features,
/// L2-normalized. Deterministic across runs and platforms.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIMENSIONS)
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dimensions];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
        {
            self.add_feature(&mut v, &word, 1.0);

            let chars: Vec<char> = format!("<{}>", word).chars().collect();
            for gram in chars.windows(3) {
                let gram: String = gram.iter().collect();
                self.add_feature(&mut v, &gram, 0.5);
            }
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }

    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        let h = fnv1a(feature.as_bytes());
        let idx = (h % self.dimensions as u64) as usize;
        let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        v[idx] += sign * weight;
    }
}

#[async_trait::async_trait]
impl TitleEmbedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    async fn embed(&self, titles: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(titles.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn check_vectors(expected: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(PipelineError::EmbeddingUnavailable(format!(
            "model returned {} vectors for {} titles",
            vectors.len(),
            expected
        )));
    }
    if let Some(first) = vectors.first() {
        let dims = first.len();
        if dims == 0 || vectors.iter().any(|v| v.len() != dims) {
            return Err(PipelineError::EmbeddingUnavailable(
                "model returned vectors of inconsistent dimensions".to_string(),
            ));
        }
        debug!("embedded {} titles ({} dims)", vectors.len(), dims);
    }
    Ok(vectors)
}

/// Cosine similarity in f64; 0.0 when either vector is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let norm_a: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}
