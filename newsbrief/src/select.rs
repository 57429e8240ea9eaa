//! Topic-weighted selection of the day's articles.
//!
//! The ranking oracle (an LLM) proposes which articles to keep. Its answer is validated
//! before use; any failure, including a missing oracle or an exhausted token budget, falls
//! back to a seeded uniform random pick so that selection itself never fails.

use chrono::Datelike;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::article::{Article, ArticleBatch, SelectedArticle};
use crate::budget::TokenBudget;
use crate::error::{PipelineError, Result};
use crate::llm::{extract_json_from_text, LlmProvider, LlmRequest, UsageMetadata};
use crate::retry::RetryPolicy;

/// Topic label -> positive weight
pub type TopicWeights = BTreeMap<String, u32>;

/// Topic assigned when no configured label matches an article
pub const GENERAL_TOPIC: &str = "general";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionSettings {
    pub cap: usize,
    pub seed: Option<u64>,
    pub use_oracle: bool,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            cap: common::DEFAULT_SELECTION_CAP,
            seed: None,
            use_oracle: true,
        }
    }
}

impl SelectionSettings {
    pub fn from_config(config: &common::Config) -> Self {
        Self {
            cap: config.selection_cap(),
            seed: config.selection_seed(),
            use_oracle: config.use_oracle(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedPick {
    pub index: usize,
    #[serde(default)]
    pub topic: Option<String>,
}

/// Oracle answer: indices into the batch, best first.
#[derive(Debug, Clone, Default)]
pub struct Ranking {
    pub picks: Vec<RankedPick>,
    pub usage: UsageMetadata,
}

#[async_trait::async_trait]
pub trait RankingOracle: Send + Sync {
    async fn rank(&self, batch: &ArticleBatch, weights: &TopicWeights, cap: usize) -> Result<Ranking>;
}

/// Check an oracle answer against a batch of `n` articles.
pub fn validate_ranking(ranking: &Ranking, n: usize, cap: usize) -> Result<()> {
    if ranking.picks.is_empty() {
        return Err(PipelineError::InvalidRanking("no picks returned".into()));
    }
    if ranking.picks.len() > cap {
        return Err(PipelineError::InvalidRanking(format!(
            "{} picks exceed the cap of {}",
            ranking.picks.len(),
            cap
        )));
    }
    let mut seen = HashSet::new();
    for pick in &ranking.picks {
        if pick.index >= n {
            return Err(PipelineError::InvalidRanking(format!(
                "index {} out of range for {} articles",
                pick.index, n
            )));
        }
        if !seen.insert(pick.index) {
            return Err(PipelineError::InvalidRanking(format!(
                "index {} returned twice",
                pick.index
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMethod {
    Oracle,
    Fallback,
    Empty,
}

impl fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SelectionMethod::Oracle => "oracle",
            SelectionMethod::Fallback => "fallback",
            SelectionMethod::Empty => "empty",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionResult {
    pub items: Vec<SelectedArticle>,
    pub method: SelectionMethod,
}

impl SelectionResult {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct Selector {
    oracle: Option<Arc<dyn RankingOracle>>,
    retry: RetryPolicy,
    budget: Option<Arc<TokenBudget>>,
    seed: Option<u64>,
}

impl Selector {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            oracle: None,
            retry,
            budget: None,
            seed: None,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn RankingOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_budget(mut self, budget: Arc<TokenBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub async fn select(&self, batch: &ArticleBatch, weights: &TopicWeights, cap: usize) -> SelectionResult {
        if batch.is_empty() || cap == 0 {
            info!("Select: nothing to select for {}", batch.date);
            return SelectionResult {
                items: Vec::new(),
                method: SelectionMethod::Empty,
            };
        }

        if let Some(oracle) = &self.oracle {
            match self.ask_oracle(oracle.as_ref(), batch, weights, cap).await {
                Ok(items) => {
                    info!("Select: oracle picked {} of {} articles", items.len(), batch.len());
                    return SelectionResult {
                        items,
                        method: SelectionMethod::Oracle,
                    };
                }
                Err(e) => warn!("Ranking oracle unusable ({}), falling back to random selection", e),
            }
        }

        let items = self.fallback(batch, weights, cap);
        info!("Select: fallback picked {} of {} articles", items.len(), batch.len());
        SelectionResult {
            items,
            method: SelectionMethod::Fallback,
        }
    }

    async fn ask_oracle(
        &self,
        oracle: &dyn RankingOracle,
        batch: &ArticleBatch,
        weights: &TopicWeights,
        cap: usize,
    ) -> Result<Vec<SelectedArticle>> {
        if let Some(budget) = &self.budget {
            budget.check()?;
        }

        let ranking = self
            .retry
            .run("ranking oracle", |_| oracle.rank(batch, weights, cap))
            .await?;

        if let Some(budget) = &self.budget {
            budget.record(ranking.usage.total_tokens);
        }
        validate_ranking(&ranking, batch.len(), cap)?;

        let items = ranking
            .picks
            .into_iter()
            .filter_map(|pick| {
                let article = batch.get(pick.index)?.clone();
                let topic = pick
                    .topic
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| keyword_topic(&article, weights));
                Some(SelectedArticle { article, topic })
            })
            .collect();
        Ok(items)
    }

    /// Uniform random `min(cap, n)` articles, kept in input order.
    fn fallback(&self, batch: &ArticleBatch, weights: &TopicWeights, cap: usize) -> Vec<SelectedArticle> {
        let n = batch.len();
        let mut indices: Vec<usize> = if n <= cap {
            (0..n).collect()
        } else {
            let seed = self.seed.unwrap_or_else(|| date_seed(batch));
            let mut rng = StdRng::seed_from_u64(seed);
            rand::seq::index::sample(&mut rng, n, cap).into_vec()
        };
        indices.sort_unstable();

        indices
            .into_iter()
            .filter_map(|i| batch.get(i))
            .map(|article| SelectedArticle {
                topic: keyword_topic(article, weights),
                article: article.clone(),
            })
            .collect()
    }
}

fn date_seed(batch: &ArticleBatch) -> u64 {
    batch.date.num_days_from_ce().unsigned_abs() as u64
}

/// Highest-weighted topic label whose words all appear in the title or description.
pub fn keyword_topic(article: &Article, weights: &TopicWeights) -> String {
    let text = format!("{} {}", article.title, article.description).to_lowercase();
    let words: HashSet<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut labels: Vec<(&String, &u32)> = weights.iter().collect();
    labels.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

    labels
        .into_iter()
        .map(|(label, _)| label)
        .find(|label| {
            let lower = label.to_lowercase();
            let mut parts = lower
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .peekable();
            parts.peek().is_some() && parts.all(|p| words.contains(p))
        })
        .cloned()
        .unwrap_or_else(|| GENERAL_TOPIC.to_string())
}

/// Ranking oracle backed by a chat-completion model.
pub struct LlmRankingOracle {
    provider: Arc<dyn LlmProvider>,
    max_tokens: usize,
}

impl LlmRankingOracle {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            max_tokens: 400,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn build_prompt(batch: &ArticleBatch, weights: &TopicWeights, cap: usize) -> String {
        let topics = weights
            .iter()
            .map(|(label, weight)| format!("- {} (weight {})", label, weight))
            .collect::<Vec<_>>()
            .join("\n");

        let articles = batch
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let desc: String = a.description.chars().take(160).collect();
                if desc.is_empty() {
                    format!("[{}] {}", i, a.title)
                } else {
                    format!("[{}] {} | {}", i, a.title, desc)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"Choose the {cap} most valuable articles for today's technology news brief.

TOPIC PREFERENCES (higher weight = more important):
{topics}

ARTICLES:
{articles}

Rules:
1. Return at most {cap} picks, best first
2. Each index must be one of the numbers in brackets, used at most once
3. Tag every pick with the topic label it best matches
4. Prefer higher-weighted topics; return fewer picks rather than off-topic ones

OUTPUT FORMAT (strict JSON):
{{"picks": [{{"index": 0, "topic": "AI"}}]}}
"#
        )
    }
}

#[derive(Debug, Deserialize)]
struct PicksJson {
    picks: Vec<RankedPick>,
}

#[async_trait::async_trait]
impl RankingOracle for LlmRankingOracle {
    async fn rank(&self, batch: &ArticleBatch, weights: &TopicWeights, cap: usize) -> Result<Ranking> {
        let request = LlmRequest {
            system: Some("You are the editor of a daily technology news brief.".to_string()),
            max_tokens: Some(self.max_tokens),
            temperature: Some(0.0),
            ..LlmRequest::new(Self::build_prompt(batch, weights, cap))
        };

        let response = self.provider.generate(request).await.map_err(PipelineError::from_llm)?;

        let json = extract_json_from_text(&response.content).ok_or_else(|| {
            PipelineError::InvalidRanking(format!("no JSON in reply: {}", response.content))
        })?;
        let parsed: PicksJson = serde_json::from_str(&json)
            .map_err(|e| PipelineError::InvalidRanking(format!("{}: {}", e, json)))?;

        Ok(Ranking {
            picks: parsed.picks,
            usage: response.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::fixtures::{article, batch, date};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed answer, or fails with a transient error a set number of times first.
    struct ScriptedOracle {
        picks: Vec<usize>,
        failures: usize,
        calls: AtomicUsize,
    }

    impl ScriptedOracle {
        fn answering(picks: &[usize]) -> Self {
            Self {
                picks: picks.to_vec(),
                failures: 0,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl RankingOracle for ScriptedOracle {
        async fn rank(&self, _batch: &ArticleBatch, _w: &TopicWeights, _cap: usize) -> Result<Ranking> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(PipelineError::Timeout(30));
            }
            Ok(Ranking {
                picks: self
                    .picks
                    .iter()
                    .map(|&index| RankedPick { index, topic: None })
                    .collect(),
                usage: UsageMetadata {
                    prompt_tokens: 90,
                    completion_tokens: 10,
                    total_tokens: 100,
                },
            })
        }
    }

    /// Ranks articles by the weight of their keyword topic, stable on ties.
    struct WeightHonoringOracle;

    #[async_trait::async_trait]
    impl RankingOracle for WeightHonoringOracle {
        async fn rank(&self, batch: &ArticleBatch, weights: &TopicWeights, cap: usize) -> Result<Ranking> {
            let mut scored: Vec<(usize, String, u32)> = batch
                .iter()
                .enumerate()
                .map(|(i, a)| {
                    let topic = keyword_topic(a, weights);
                    let weight = weights.get(&topic).copied().unwrap_or(0);
                    (i, topic, weight)
                })
                .collect();
            scored.sort_by(|a, b| b.2.cmp(&a.2));
            Ok(Ranking {
                picks: scored
                    .into_iter()
                    .take(cap)
                    .map(|(index, topic, _)| RankedPick { index, topic: Some(topic) })
                    .collect(),
                usage: UsageMetadata::default(),
            })
        }
    }

    fn ten() -> ArticleBatch {
        batch(&[
            "a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7", "a8", "a9",
        ])
    }

    fn weights(pairs: &[(&str, u32)]) -> TopicWeights {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn urls(result: &SelectionResult) -> Vec<String> {
        result.items.iter().map(|s| s.article.url.clone()).collect()
    }

    #[tokio::test]
    async fn fallback_without_oracle_is_capped_and_reproducible() {
        let selector = Selector::new(RetryPolicy::immediate(3)).with_seed(Some(42));
        let first = selector.select(&ten(), &TopicWeights::new(), 6).await;
        let second = selector.select(&ten(), &TopicWeights::new(), 6).await;

        assert_eq!(first.method, SelectionMethod::Fallback);
        assert_eq!(first.len(), 6);
        assert_eq!(urls(&first), urls(&second));

        let unique: HashSet<_> = urls(&first).into_iter().collect();
        assert_eq!(unique.len(), 6);
    }

    #[tokio::test]
    async fn fallback_seed_defaults_to_date() {
        let selector = Selector::new(RetryPolicy::immediate(1));
        let a = selector.select(&ten(), &TopicWeights::new(), 6).await;
        let b = selector.select(&ten(), &TopicWeights::new(), 6).await;
        assert_eq!(urls(&a), urls(&b));
    }

    #[tokio::test]
    async fn fallback_cap_invariant() {
        let selector = Selector::new(RetryPolicy::immediate(1)).with_seed(Some(7));
        for n in 1..=10 {
            let titles: Vec<String> = (0..n).map(|i| format!("t{}", i)).collect();
            let refs: Vec<&str> = titles.iter().map(String::as_str).collect();
            let result = selector.select(&batch(&refs), &TopicWeights::new(), 6).await;
            assert_eq!(result.len(), n.min(6));
        }
    }

    #[tokio::test]
    async fn small_input_returns_everything_in_order() {
        let selector = Selector::new(RetryPolicy::immediate(1));
        let result = selector.select(&batch(&["x", "y", "z"]), &TopicWeights::new(), 6).await;
        assert_eq!(urls(&result), vec![
            "https://example.com/0",
            "https://example.com/1",
            "https://example.com/2",
        ]);
    }

    #[tokio::test]
    async fn empty_input_is_explicit() {
        let selector = Selector::new(RetryPolicy::immediate(1))
            .with_oracle(Arc::new(ScriptedOracle::answering(&[0])));
        let result = selector.select(&ArticleBatch::empty(date()), &TopicWeights::new(), 6).await;
        assert_eq!(result.method, SelectionMethod::Empty);
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn valid_oracle_answer_is_used_in_its_order() {
        let oracle = Arc::new(ScriptedOracle::answering(&[7, 2, 5]));
        let budget = Arc::new(TokenBudget::new(4000, false));
        let selector = Selector::new(RetryPolicy::immediate(3))
            .with_oracle(oracle)
            .with_budget(budget.clone());

        let result = selector.select(&ten(), &TopicWeights::new(), 6).await;
        assert_eq!(result.method, SelectionMethod::Oracle);
        assert_eq!(urls(&result), vec![
            "https://example.com/7",
            "https://example.com/2",
            "https://example.com/5",
        ]);
        assert!(result.items.iter().all(|s| s.topic == GENERAL_TOPIC));
        assert_eq!(budget.used(), 100);
    }

    #[tokio::test]
    async fn invalid_oracle_answers_fall_back() {
        let bad_answers: [&[usize]; 4] = [
            &[3, 12],                 // out of range
            &[1, 1, 2],               // duplicate
            &[0, 1, 2, 3, 4, 5, 6],   // too many
            &[],                      // empty
        ];
        for answer in bad_answers {
            let selector = Selector::new(RetryPolicy::immediate(3))
                .with_oracle(Arc::new(ScriptedOracle::answering(answer)))
                .with_seed(Some(1));
            let result = selector.select(&ten(), &TopicWeights::new(), 6).await;
            assert_eq!(result.method, SelectionMethod::Fallback, "answer {:?}", answer);
            assert_eq!(result.len(), 6);
        }
    }

    #[tokio::test]
    async fn transient_oracle_failures_are_retried() {
        let oracle = Arc::new(ScriptedOracle {
            picks: vec![0, 1],
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let selector = Selector::new(RetryPolicy::immediate(3)).with_oracle(oracle.clone());
        let result = selector.select(&ten(), &TopicWeights::new(), 6).await;
        assert_eq!(result.method, SelectionMethod::Oracle);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn oracle_down_after_retries_falls_back() {
        let oracle = Arc::new(ScriptedOracle {
            picks: vec![0],
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let selector = Selector::new(RetryPolicy::immediate(3))
            .with_oracle(oracle.clone())
            .with_seed(Some(3));
        let result = selector.select(&ten(), &TopicWeights::new(), 6).await;
        assert_eq!(result.method, SelectionMethod::Fallback);
        assert_eq!(result.len(), 6);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_skips_the_oracle() {
        let oracle = Arc::new(ScriptedOracle::answering(&[0]));
        let budget = Arc::new(TokenBudget::new(10, true));
        budget.record(10);
        let selector = Selector::new(RetryPolicy::immediate(3))
            .with_oracle(oracle.clone())
            .with_budget(budget);
        let result = selector.select(&ten(), &TopicWeights::new(), 6).await;
        assert_eq!(result.method, SelectionMethod::Fallback);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn raising_a_weight_never_lowers_its_share() {
        let mut articles = Vec::new();
        for i in 0..5 {
            articles.push(article(&format!("New chips from vendor {}", i), &format!("https://c/{}", i)));
        }
        for i in 0..5 {
            articles.push(article(&format!("AI model release {}", i), &format!("https://a/{}", i)));
        }
        let input = ArticleBatch::new(date(), articles);
        let selector = Selector::new(RetryPolicy::immediate(1)).with_oracle(Arc::new(WeightHonoringOracle));

        let count_ai = |r: &SelectionResult| r.items.iter().filter(|s| s.topic == "AI").count();
        let before = selector.select(&input, &weights(&[("AI", 1), ("chips", 1)]), 4).await;
        let after = selector.select(&input, &weights(&[("AI", 2), ("chips", 1)]), 4).await;

        assert_eq!(before.method, SelectionMethod::Oracle);
        assert!(count_ai(&after) >= count_ai(&before));
        assert_eq!(count_ai(&after), 4);
    }

    #[test]
    fn keyword_topic_prefers_heavier_labels() {
        let w = weights(&[("AI", 3), ("chips", 2), ("open source", 1)]);
        assert_eq!(keyword_topic(&article("NVIDIA unveils AI chips", "u"), &w), "AI");
        assert_eq!(keyword_topic(&article("New chips said to ship", "u"), &w), "chips");
        assert_eq!(keyword_topic(&article("Going open source today", "u"), &w), "open source");
        assert_eq!(keyword_topic(&article("Weather report", "u"), &w), GENERAL_TOPIC);
    }

    #[test]
    fn validation_rules() {
        let ranking = |picks: &[usize]| Ranking {
            picks: picks.iter().map(|&index| RankedPick { index, topic: None }).collect(),
            usage: UsageMetadata::default(),
        };
        assert!(validate_ranking(&ranking(&[0, 2]), 3, 6).is_ok());
        assert!(validate_ranking(&ranking(&[3]), 3, 6).is_err());
        assert!(validate_ranking(&ranking(&[1, 1]), 3, 6).is_err());
        assert!(validate_ranking(&ranking(&[0, 1, 2]), 3, 2).is_err());
        assert!(validate_ranking(&ranking(&[]), 3, 6).is_err());
    }

    #[test]
    fn prompt_lists_indices_and_weights() {
        let prompt = LlmRankingOracle::build_prompt(&batch(&["First", "Second"]), &weights(&[("AI", 2)]), 6);
        assert!(prompt.contains("[0] First"));
        assert!(prompt.contains("[1] Second"));
        assert!(prompt.contains("- AI (weight 2)"));
        assert!(prompt.contains("at most 6 picks"));
    }
}
