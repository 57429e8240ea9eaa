//! Daily pipeline orchestration: Fetch -> Dedup -> Select -> Summarize -> Write -> Publish.
//!
//! Every stage reads its input from the artifact the previous stage wrote for the same date,
//! so any stage can be re-run on its own and a failed run can resume where it stopped.

use anyhow::{bail, Context};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::article::{ArtifactKind, ArtifactStore, SelectedArticle, SummarizedArticle};
use crate::budget::TokenBudget;
use crate::dedup::{DedupSettings, Deduplicator};
#[cfg(feature = "local-embeddings")]
use crate::embedding::LocalEmbedder;
use crate::embedding::{HashingEmbedder, RemoteEmbedder, TitleEmbedder};
use crate::error::{PipelineError, Result, StageFailure};
use crate::llm::remote::RemoteLlmProvider;
use crate::llm::summarizer::{ArticleSummarizer, ExcerptSummarizer, LlmArticleSummarizer, UnconfiguredSummarizer};
use crate::llm::LlmProvider;
use crate::publisher::{GitPublisher, PublishOutcome, Publisher};
use crate::retry::RetryPolicy;
use crate::select::{LlmRankingOracle, SelectionMethod, SelectionSettings, Selector, TopicWeights};
use crate::sources::Fetcher;
use crate::writer::MarkdownWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
pub enum Stage {
    Fetch,
    Dedup,
    Select,
    Summarize,
    Write,
    Publish,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Fetch,
        Stage::Dedup,
        Stage::Select,
        Stage::Summarize,
        Stage::Write,
        Stage::Publish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Dedup => "dedup",
            Stage::Select => "select",
            Stage::Summarize => "summarize",
            Stage::Write => "write",
            Stage::Publish => "publish",
        }
    }

    pub fn next(&self) -> Option<Stage> {
        let pos = Stage::ALL.iter().position(|s| s == self)?;
        Stage::ALL.get(pos + 1).copied()
    }

    /// Stages whose external calls go through the retry policy
    pub fn is_retried(&self) -> bool {
        matches!(self, Stage::Fetch | Stage::Select | Stage::Summarize)
    }

    /// JSON artifact this stage writes, if any
    pub fn output_artifact(&self) -> Option<ArtifactKind> {
        match self {
            Stage::Fetch => Some(ArtifactKind::Raw),
            Stage::Dedup => Some(ArtifactKind::Dedup),
            Stage::Select => Some(ArtifactKind::Select),
            Stage::Summarize => Some(ArtifactKind::Summary),
            Stage::Write | Stage::Publish => None,
        }
    }

    fn completed_phase(&self, dry_run: bool) -> PipelinePhase {
        match self {
            Stage::Fetch => PipelinePhase::Fetched,
            Stage::Dedup => PipelinePhase::Deduped,
            Stage::Select => PipelinePhase::Selected,
            Stage::Summarize => PipelinePhase::Summarized,
            Stage::Write => PipelinePhase::Written,
            Stage::Publish if dry_run => PipelinePhase::SkippedPublish,
            Stage::Publish => PipelinePhase::Published,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PipelineError::Config(format!("unknown stage '{}'", s)))
    }
}

/// How far a run for one date has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Pending,
    Fetched,
    Deduped,
    Selected,
    Summarized,
    Written,
    Published,
    SkippedPublish,
}

/// Per-date bookkeeping for a single run.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub date: NaiveDate,
    pub dry_run: bool,
    pub phase: PipelinePhase,
    pub artifacts: BTreeMap<Stage, PathBuf>,
    pub durations: Vec<(Stage, Duration)>,
    pub tokens_used: usize,
    pub selection_method: Option<SelectionMethod>,
    pub publish_outcome: Option<PublishOutcome>,
}

impl PipelineState {
    pub fn new(date: NaiveDate, dry_run: bool) -> Self {
        Self {
            date,
            dry_run,
            phase: PipelinePhase::Pending,
            artifacts: BTreeMap::new(),
            durations: Vec::new(),
            tokens_used: 0,
            selection_method: None,
            publish_outcome: None,
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.durations.iter().map(|(_, d)| *d).sum()
    }

    pub fn duration_of(&self, stage: Stage) -> Option<Duration> {
        self.durations.iter().find(|(s, _)| *s == stage).map(|(_, d)| *d)
    }
}

pub struct Pipeline {
    store: ArtifactStore,
    fetcher: Fetcher,
    deduplicator: Deduplicator,
    dedup: DedupSettings,
    selector: Selector,
    selection: SelectionSettings,
    topics: TopicWeights,
    summarizer: Arc<dyn ArticleSummarizer>,
    writer: MarkdownWriter,
    publisher: Arc<dyn Publisher>,
    retry: RetryPolicy,
    budget: Arc<TokenBudget>,
}

impl Pipeline {
    /// Pipeline with default settings, no ranking oracle, pages under `content/news`.
    pub fn new(
        store: ArtifactStore,
        fetcher: Fetcher,
        deduplicator: Deduplicator,
        summarizer: Arc<dyn ArticleSummarizer>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let retry = RetryPolicy::default();
        Self {
            store,
            fetcher,
            deduplicator,
            dedup: DedupSettings::default(),
            selector: Selector::new(retry.clone()),
            selection: SelectionSettings::default(),
            topics: TopicWeights::new(),
            summarizer,
            writer: MarkdownWriter::new("content/news"),
            publisher,
            retry,
            budget: Arc::new(TokenBudget::new(common::DEFAULT_DAILY_TOKENS, false)),
        }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_writer(mut self, writer: MarkdownWriter) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_dedup_settings(mut self, dedup: DedupSettings) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_selection_settings(mut self, selection: SelectionSettings) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_topics(mut self, topics: TopicWeights) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_budget(mut self, budget: Arc<TokenBudget>) -> Self {
        self.budget = budget;
        self
    }

    /// Wire every component from configuration.
    pub fn from_config(config: &common::Config) -> anyhow::Result<Self> {
        let retry = RetryPolicy::from_config(config);
        let budget = Arc::new(TokenBudget::from_config(config));
        let selection = SelectionSettings::from_config(config);
        let llm = config.llm.clone().unwrap_or_default();

        let (summarizer, oracle): (Arc<dyn ArticleSummarizer>, Option<LlmRankingOracle>) =
            match llm.adapter.as_deref().unwrap_or("remote") {
                "remote" => {
                    let summarization = llm
                        .summarization
                        .as_ref()
                        .or(llm.remote.as_ref())
                        .cloned()
                        .unwrap_or_default();
                    let summarizer: Arc<dyn ArticleSummarizer> =
                        match RemoteLlmProvider::from_config(&summarization, "gpt-4o-mini") {
                            Ok(provider) => {
                                info!("Summarization LLM initialized: {}", provider.model());
                                let provider: Arc<dyn LlmProvider> = Arc::new(provider);
                                Arc::new(
                                    LlmArticleSummarizer::new(provider, config.summary_language())
                                        .with_max_tokens(summarization.max_tokens.unwrap_or(300)),
                                )
                            }
                            Err(e) => {
                                warn!("Summarization LLM unavailable: {:#}", e);
                                Arc::new(UnconfiguredSummarizer::new(format!("summarization LLM: {:#}", e)))
                            }
                        };

                    let oracle = if selection.use_oracle {
                        let ranking = llm
                            .selection
                            .as_ref()
                            .or(llm.remote.as_ref())
                            .cloned()
                            .unwrap_or_default();
                        match RemoteLlmProvider::from_config(&ranking, "gpt-4o-mini") {
                            Ok(provider) => Some(
                                LlmRankingOracle::new(Arc::new(provider))
                                    .with_max_tokens(ranking.max_tokens.unwrap_or(400)),
                            ),
                            Err(e) => {
                                warn!("Selection LLM unavailable, using fallback selection: {:#}", e);
                                None
                            }
                        }
                    } else {
                        None
                    };
                    (summarizer, oracle)
                }
                "none" => {
                    warn!("LLM adapter disabled; using excerpt summaries and random selection");
                    (Arc::new(ExcerptSummarizer::default()) as Arc<dyn ArticleSummarizer>, None)
                }
                other => bail!("unknown llm.adapter '{}' (expected remote or none)", other),
            };

        let embedding = config.embedding.clone().unwrap_or_default();
        let embedder: Arc<dyn TitleEmbedder> = match embedding.adapter.as_deref().unwrap_or("local") {
            #[cfg(feature = "local-embeddings")]
            "local" => Arc::new(LocalEmbedder::load(embedding.cache_dir.as_ref().map(PathBuf::from))?),
            #[cfg(not(feature = "local-embeddings"))]
            "local" => bail!("embedding.adapter 'local' needs the local-embeddings feature"),
            "hashing" => Arc::new(HashingEmbedder::new(
                embedding
                    .dimensions
                    .unwrap_or(crate::embedding::DEFAULT_HASHING_DIMENSIONS),
            )),
            "remote" => {
                let remote = embedding.remote.clone().unwrap_or_default();
                let model = remote
                    .model
                    .clone()
                    .unwrap_or_else(|| "text-embedding-3-small".to_string());
                let provider = RemoteLlmProvider::from_config(&remote, &model)
                    .context("failed to initialize embedding model")?;
                Arc::new(RemoteEmbedder::new(Arc::new(provider), model))
            }
            other => bail!("unknown embedding.adapter '{}' (expected local, hashing or remote)", other),
        };
        info!("Title embedding model: {}", embedder.name());

        let mut selector = Selector::new(retry.clone())
            .with_budget(budget.clone())
            .with_seed(selection.seed);
        if let Some(oracle) = oracle {
            selector = selector.with_oracle(Arc::new(oracle));
        }

        let fetcher = Fetcher::from_config(config, retry.clone())?;
        info!("News sources: {}", fetcher.source_names().join(", "));

        let pipeline = Pipeline::new(
            ArtifactStore::new(config.artifact_dir()),
            fetcher,
            Deduplicator::new(embedder),
            summarizer,
            Arc::new(GitPublisher::from_config(config)),
        )
        .with_selector(selector)
        .with_writer(MarkdownWriter::new(config.content_dir()))
        .with_dedup_settings(DedupSettings::from_config(config))
        .with_selection_settings(selection)
        .with_topics(config.topics.clone())
        .with_retry(retry)
        .with_budget(budget);
        Ok(pipeline)
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub async fn run(&self, date: NaiveDate, dry_run: bool) -> std::result::Result<PipelineState, StageFailure> {
        self.run_from(date, dry_run, Stage::Fetch).await
    }

    /// Run `start` and every stage after it, reading earlier stages' output from disk.
    pub async fn run_from(
        &self,
        date: NaiveDate,
        dry_run: bool,
        start: Stage,
    ) -> std::result::Result<PipelineState, StageFailure> {
        info!("Starting news pipeline for {} from {}{}", date, start, if dry_run { " (dry run)" } else { "" });

        let mut state = PipelineState::new(date, dry_run);
        let mut stage = Some(start);
        while let Some(current) = stage {
            self.run_stage(&mut state, current).await?;
            stage = current.next();
        }

        info!(
            "Pipeline finished for {} in {:.2}s ({:?}, {} tokens)",
            date,
            state.total_duration().as_secs_f64(),
            state.phase,
            state.tokens_used
        );
        self.budget.log_summary();
        Ok(state)
    }

    /// First stage whose output is missing for `date`.
    pub fn resume_point(&self, date: NaiveDate) -> Stage {
        for stage in Stage::ALL {
            let done = match stage.output_artifact() {
                Some(kind) => self.store.exists(kind, date),
                None if stage == Stage::Write => self.writer.output_path(date).is_file(),
                None => false,
            };
            if !done {
                return stage;
            }
        }
        Stage::Publish
    }

    /// Execute exactly one stage and record its timing in `state`.
    pub async fn run_stage(&self, state: &mut PipelineState, stage: Stage) -> std::result::Result<(), StageFailure> {
        info!("=== Stage: {} ({}) ===", stage, state.date);
        let started = Instant::now();

        let outcome = self.execute(state, stage).await;
        let elapsed = started.elapsed();
        state.durations.push((stage, elapsed));
        state.tokens_used = self.budget.used();

        match outcome {
            Ok(()) => {
                state.phase = stage.completed_phase(state.dry_run);
                info!("{} completed in {:.2}s", stage, elapsed.as_secs_f64());
                Ok(())
            }
            Err(error) => {
                error!("{} failed after {:.2}s ({}): {}", stage, elapsed.as_secs_f64(), error.kind(), error);
                Err(StageFailure {
                    stage,
                    date: state.date,
                    error,
                })
            }
        }
    }

    async fn execute(&self, state: &mut PipelineState, stage: Stage) -> Result<()> {
        let date = state.date;
        match stage {
            Stage::Fetch => {
                let batch = self.fetcher.fetch_all(date).await?;
                let path = self.store.save_batch(ArtifactKind::Raw, &batch).await?;
                info!("Fetched {} articles", batch.len());
                state.artifacts.insert(stage, path);
            }
            Stage::Dedup => {
                let raw = self.store.load_batch(ArtifactKind::Raw, date).await?;
                let unique = self.deduplicator.dedupe(raw, self.dedup.threshold).await?;
                let path = self.store.save_batch(ArtifactKind::Dedup, &unique).await?;
                state.artifacts.insert(stage, path);
            }
            Stage::Select => {
                let deduped = self.store.load_batch(ArtifactKind::Dedup, date).await?;
                let result = self
                    .selector
                    .select(&deduped, &self.topics, self.selection.cap)
                    .await;
                let path = self.store.save(ArtifactKind::Select, date, &result.items).await?;
                state.selection_method = Some(result.method);
                state.artifacts.insert(stage, path);
            }
            Stage::Summarize => {
                let selected: Vec<SelectedArticle> = self.store.load(ArtifactKind::Select, date).await?;
                let summarized = self.summarize_all(selected).await?;
                let path = self.store.save(ArtifactKind::Summary, date, &summarized).await?;
                state.artifacts.insert(stage, path);
            }
            Stage::Write => {
                let summarized: Vec<SummarizedArticle> = self.store.load(ArtifactKind::Summary, date).await?;
                let path = self.writer.write(date, &summarized).await?;
                state.artifacts.insert(stage, path);
            }
            Stage::Publish => {
                if state.dry_run {
                    info!("Dry run: skipping publish for {}", date);
                } else {
                    let outcome = self.publisher.publish(date).await?;
                    info!("Publish outcome: {}", outcome);
                    state.publish_outcome = Some(outcome);
                }
            }
        }
        Ok(())
    }

    async fn summarize_all(&self, selected: Vec<SelectedArticle>) -> Result<Vec<SummarizedArticle>> {
        let total = selected.len();
        let mut out = Vec::with_capacity(total);

        for (i, item) in selected.into_iter().enumerate() {
            self.budget.check()?;
            let label = format!("summarize {}/{}", i + 1, total);
            let summary = self
                .retry
                .run(&label, |_| self.summarizer.summarize(&item))
                .await?;
            self.budget.record(summary.usage.total_tokens);

            out.push(SummarizedArticle {
                selected: item,
                summary: summary.summary,
                bullets: summary.bullets,
            });
        }

        info!("Summarized {} articles ({} tokens so far)", out.len(), self.budget.used());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_chain_in_order() {
        let mut chain = vec![Stage::Fetch];
        while let Some(next) = chain.last().and_then(|s| s.next()) {
            chain.push(next);
        }
        assert_eq!(chain, Stage::ALL.to_vec());
    }

    #[test]
    fn stage_names_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(stage.to_string().parse::<Stage>().unwrap(), stage);
        }
        assert_eq!("Dedup".parse::<Stage>().unwrap(), Stage::Dedup);
        assert!("deploy".parse::<Stage>().is_err());
    }

    #[test]
    fn only_external_stages_retry() {
        let retried: Vec<Stage> = Stage::ALL.into_iter().filter(Stage::is_retried).collect();
        assert_eq!(retried, vec![Stage::Fetch, Stage::Select, Stage::Summarize]);
    }

    #[tokio::test]
    async fn missing_llm_key_only_blocks_summarize() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = common::RemoteLlmConfig {
            api_key_env: Some("NEWSBRIEF_TEST_UNSET_KEY".into()),
            ..Default::default()
        };
        let config = common::Config {
            pipeline: Some(common::PipelineConfig {
                artifact_dir: Some(dir.path().display().to_string()),
                content_dir: None,
            }),
            llm: Some(common::LlmConfig {
                remote: Some(endpoint),
                ..Default::default()
            }),
            embedding: Some(common::EmbeddingConfig {
                adapter: Some("hashing".into()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let pipeline = Pipeline::from_config(&config).expect("pipeline builds without an LLM key");

        let selected = vec![SelectedArticle {
            article: crate::article::fixtures::article("NVIDIA unveils chips", "https://example.com/n"),
            topic: "Chips".into(),
        }];
        let date = crate::article::fixtures::date();
        pipeline.store().save(ArtifactKind::Select, date, &selected).await.unwrap();

        let mut state = PipelineState::new(date, true);
        let failure = pipeline.run_stage(&mut state, Stage::Summarize).await.unwrap_err();
        assert_eq!(failure.kind(), crate::error::ErrorKind::Structural);
        assert!(failure.to_string().contains("NEWSBRIEF_TEST_UNSET_KEY"));
        assert!(!pipeline.store().exists(ArtifactKind::Summary, date));
    }

    #[test]
    fn publish_phase_depends_on_dry_run() {
        assert_eq!(Stage::Publish.completed_phase(true), PipelinePhase::SkippedPublish);
        assert_eq!(Stage::Publish.completed_phase(false), PipelinePhase::Published);
        assert_eq!(Stage::Write.completed_phase(true), PipelinePhase::Written);
    }
}
