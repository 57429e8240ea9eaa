// Library interface for the newsbrief pipeline
// The binary and the integration tests import everything from here

pub mod article;
pub mod budget;
pub mod dedup;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod publisher;
pub mod retry;
pub mod select;
pub mod sources;
pub mod writer;

pub use article::{Article, ArticleBatch, ArtifactKind, ArtifactStore, SelectedArticle, Source, SummarizedArticle};
pub use error::{ErrorKind, PipelineError, StageFailure};
pub use pipeline::{Pipeline, PipelinePhase, PipelineState, Stage};
