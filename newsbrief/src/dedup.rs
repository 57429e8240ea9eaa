//! Near-duplicate removal over article titles.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::article::{Article, ArticleBatch};
use crate::embedding::{cosine_similarity, TitleEmbedder};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupSettings {
    pub threshold: f64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            threshold: common::DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl DedupSettings {
    pub fn from_config(config: &common::Config) -> Self {
        Self {
            threshold: config.similarity_threshold(),
        }
    }
}

/// Lookup over the embeddings of already-kept articles.
pub trait SimilarityIndex: Send {
    fn insert(&mut self, vector: Vec<f32>);

    /// Position and similarity of the closest kept vector
    fn nearest(&self, vector: &[f32]) -> Option<(usize, f64)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exhaustive scan; O(n) per lookup.
#[derive(Debug, Default)]
pub struct LinearIndex {
    vectors: Vec<Vec<f32>>,
}

impl SimilarityIndex for LinearIndex {
    fn insert(&mut self, vector: Vec<f32>) {
        self.vectors.push(vector);
    }

    fn nearest(&self, vector: &[f32]) -> Option<(usize, f64)> {
        self.vectors
            .iter()
            .enumerate()
            .map(|(i, kept)| (i, cosine_similarity(kept, vector)))
            .fold(None, |best: Option<(usize, f64)>, (i, sim)| match best {
                Some((_, best_sim)) if best_sim >= sim => best,
                _ => Some((i, sim)),
            })
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }
}

pub struct Deduplicator {
    embedder: Arc<dyn TitleEmbedder>,
}

impl Deduplicator {
    pub fn new(embedder: Arc<dyn TitleEmbedder>) -> Self {
        Self { embedder }
    }

    /// Drop every article whose title is at least `threshold` similar to an earlier kept one.
    /// Input order decides the survivor of each duplicate cluster.
    pub async fn dedupe(&self, batch: ArticleBatch, threshold: f64) -> Result<ArticleBatch> {
        self.dedupe_with(batch, threshold, LinearIndex::default()).await
    }

    pub async fn dedupe_with<I: SimilarityIndex>(
        &self,
        batch: ArticleBatch,
        threshold: f64,
        mut index: I,
    ) -> Result<ArticleBatch> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(PipelineError::Config(format!(
                "dedup threshold must be in (0, 1], got {}",
                threshold
            )));
        }

        let date = batch.date;
        let input_len = batch.len();
        if input_len <= 1 {
            return Ok(batch);
        }

        let articles = collapse_repeated_urls(batch.into_articles());
        if articles.len() <= 1 {
            return Ok(ArticleBatch::new(date, articles));
        }

        let titles: Vec<String> = articles.iter().map(|a| a.title.clone()).collect();
        let vectors = self.embedder.embed(&titles).await?;
        if vectors.len() != articles.len() {
            return Err(PipelineError::EmbeddingUnavailable(format!(
                "{} returned {} vectors for {} titles",
                self.embedder.name(),
                vectors.len(),
                articles.len()
            )));
        }

        let mut seen_titles = HashSet::new();
        let mut kept = Vec::with_capacity(articles.len());
        for (article, vector) in articles.into_iter().zip(vectors) {
            let key = normalize_title(&article.title);
            if seen_titles.contains(&key) {
                debug!("duplicate title dropped: {}", article.title);
                continue;
            }
            if let Some((pos, sim)) = index.nearest(&vector) {
                if sim >= threshold {
                    debug!(
                        "near-duplicate dropped ({:.3} vs kept #{}): {}",
                        sim, pos, article.title
                    );
                    continue;
                }
            }
            seen_titles.insert(key);
            index.insert(vector);
            kept.push(article);
        }

        info!(
            "Dedup: {} -> {} articles (threshold {}, model {})",
            input_len,
            kept.len(),
            threshold,
            self.embedder.name()
        );
        Ok(ArticleBatch::new(date, kept))
    }
}

fn collapse_repeated_urls(articles: Vec<Article>) -> Vec<Article> {
    let mut seen = HashSet::new();
    articles
        .into_iter()
        .filter(|a| seen.insert(a.url.trim().to_string()))
        .collect()
}

fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::fixtures::{article, batch, date};
    use crate::embedding::HashingEmbedder;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns fixed vectors per title and counts calls.
    struct FixedEmbedder {
        vectors: HashMap<String, Vec<f32>>,
        calls: AtomicUsize,
    }

    impl FixedEmbedder {
        fn new(pairs: &[(&str, Vec<f32>)]) -> Self {
            Self {
                vectors: pairs
                    .iter()
                    .map(|(t, v)| (t.to_string(), v.clone()))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl TitleEmbedder for FixedEmbedder {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn embed(&self, titles: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(titles
                .iter()
                .map(|t| self.vectors.get(t).cloned().unwrap_or_else(|| vec![0.0, 1.0]))
                .collect())
        }
    }

    struct MissingModel;

    #[async_trait::async_trait]
    impl TitleEmbedder for MissingModel {
        fn name(&self) -> &str {
            "missing"
        }

        async fn embed(&self, _titles: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(PipelineError::EmbeddingUnavailable("model not loaded".into()))
        }
    }

    fn hashing() -> Deduplicator {
        Deduplicator::new(Arc::new(HashingEmbedder::default()))
    }

    fn titles(batch: &ArticleBatch) -> Vec<&str> {
        batch.iter().map(|a| a.title.as_str()).collect()
    }

    #[tokio::test]
    async fn collapses_repeated_headline() {
        let input = batch(&[
            "OpenAI launches GPT-5",
            "OpenAI launches GPT-5",
            "NVIDIA unveils chips",
        ]);
        let out = hashing().dedupe(input, 0.85).await.unwrap();
        assert_eq!(titles(&out), vec!["OpenAI launches GPT-5", "NVIDIA unveils chips"]);
        assert_eq!(out.get(0).unwrap().url, "https://example.com/0");
    }

    #[tokio::test]
    async fn similarity_equal_to_threshold_collapses() {
        let a = vec![1.0f32, 1.0];
        let b = vec![1.0f32, 0.0];
        let boundary = cosine_similarity(&a, &b);
        let embedder = Arc::new(FixedEmbedder::new(&[("first", a), ("second", b)]));
        let dedup = Deduplicator::new(embedder);

        let out = dedup.dedupe(batch(&["first", "second"]), boundary).await.unwrap();
        assert_eq!(titles(&out), vec!["first"]);

        let out = dedup
            .dedupe(batch(&["first", "second"]), boundary + 1e-6)
            .await
            .unwrap();
        assert_eq!(titles(&out), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn dedup_is_idempotent() {
        let input = batch(&[
            "Apple ships M4 iPad",
            "Apple ships M4 iPad",
            "Rust 2024 edition released",
            "Quantum error correction milestone",
        ]);
        let dedup = hashing();
        let once = dedup.dedupe(input, 0.85).await.unwrap();
        let twice = dedup.dedupe(once.clone(), 0.85).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn first_occurrence_survives_regardless_of_case() {
        let mut input = batch(&["openai launches gpt-5", "NVIDIA unveils chips"]).into_articles();
        input.insert(1, article("  OpenAI   Launches GPT-5 ", "https://other.example/gpt5"));
        let out = hashing()
            .dedupe(ArticleBatch::new(date(), input), 0.99)
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.get(0).unwrap().url, "https://example.com/0");
    }

    #[tokio::test]
    async fn small_batches_skip_the_model() {
        let embedder = Arc::new(FixedEmbedder::new(&[]));
        let dedup = Deduplicator::new(embedder.clone());

        let empty = dedup.dedupe(ArticleBatch::empty(date()), 0.85).await.unwrap();
        assert!(empty.is_empty());
        let single = dedup.dedupe(batch(&["only"]), 0.85).await.unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeated_urls_collapse_before_embedding() {
        let input = ArticleBatch::new(
            date(),
            vec![
                article("Chip export rules tighten", "https://example.com/a"),
                article("Chip export rules tighten (updated)", "https://example.com/a"),
            ],
        );
        let embedder = Arc::new(FixedEmbedder::new(&[]));
        let dedup = Deduplicator::new(embedder.clone());
        let out = dedup.dedupe(input, 0.85).await.unwrap();
        assert_eq!(titles(&out), vec!["Chip export rules tighten"]);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_model_is_structural() {
        let dedup = Deduplicator::new(Arc::new(MissingModel));
        let err = dedup.dedupe(batch(&["a", "b"]), 0.85).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Structural);
    }

    #[tokio::test]
    async fn rejects_threshold_out_of_range() {
        let err = hashing().dedupe(batch(&["a", "b"]), 0.0).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn linear_index_reports_closest() {
        let mut index = LinearIndex::default();
        assert!(index.nearest(&[1.0, 0.0]).is_none());
        index.insert(vec![0.0, 1.0]);
        index.insert(vec![1.0, 0.1]);
        let (pos, sim) = index.nearest(&[1.0, 0.0]).unwrap();
        assert_eq!(pos, 1);
        assert!(sim > 0.99);
        assert_eq!(index.len(), 2);
    }
}
