//! Commits the generated pages to a git repository and optionally pushes them.

use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

pub const DEFAULT_COMMIT_MESSAGE: &str = "Add daily news for {date} - Auto-generated content";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    Published,
    /// Working tree clean; nothing was committed
    NoChanges,
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishOutcome::Published => f.write_str("published"),
            PublishOutcome::NoChanges => f.write_str("no changes"),
        }
    }
}

#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, date: NaiveDate) -> Result<PublishOutcome>;
}

#[derive(Debug, Clone)]
pub struct GitPublisher {
    repo_path: PathBuf,
    remote: Option<String>,
    branch: Option<String>,
    auto_push: bool,
    commit_message: String,
}

impl GitPublisher {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            remote: None,
            branch: None,
            auto_push: true,
            commit_message: DEFAULT_COMMIT_MESSAGE.to_string(),
        }
    }

    pub fn from_config(config: &common::Config) -> Self {
        let cfg = config.publisher.clone().unwrap_or_default();
        Self {
            repo_path: PathBuf::from(cfg.repo_path.unwrap_or_else(|| ".".to_string())),
            remote: cfg.remote,
            branch: cfg.branch,
            auto_push: cfg.auto_push.unwrap_or(true),
            commit_message: cfg
                .commit_message
                .unwrap_or_else(|| DEFAULT_COMMIT_MESSAGE.to_string()),
        }
    }

    pub fn with_auto_push(mut self, auto_push: bool) -> Self {
        self.auto_push = auto_push;
        self
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn commit_message(&self, date: NaiveDate) -> String {
        self.commit_message
            .replace("{date}", &date.format("%Y-%m-%d").to_string())
    }

    async fn git(&self, args: &[&str]) -> Result<GitOutput> {
        debug!("git {}", args.join(" "));
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| PipelineError::Publish(format!("failed to run git {}: {}", args[0], e)))?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn git_checked(&self, args: &[&str]) -> Result<GitOutput> {
        let out = self.git(args).await?;
        if !out.success {
            return Err(PipelineError::Publish(format!(
                "git {} failed: {}",
                args.join(" "),
                out.stderr.trim()
            )));
        }
        Ok(out)
    }
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    fn nothing_to_commit(&self) -> bool {
        is_nothing_to_commit(&self.stdout) || is_nothing_to_commit(&self.stderr)
    }
}

fn is_nothing_to_commit(text: &str) -> bool {
    text.contains("nothing to commit")
}

#[async_trait::async_trait]
impl Publisher for GitPublisher {
    async fn publish(&self, date: NaiveDate) -> Result<PublishOutcome> {
        info!("Starting publish workflow in: {}", self.repo_path.display());

        let status = self.git_checked(&["status", "--porcelain"]).await?;
        if status.stdout.trim().is_empty() {
            info!("No changes to publish");
            return Ok(PublishOutcome::NoChanges);
        }

        self.git_checked(&["add", "."]).await?;

        let message = self.commit_message(date);
        let commit = self.git(&["commit", "-m", &message]).await?;
        if !commit.success {
            if commit.nothing_to_commit() {
                info!("Nothing to commit, working tree clean");
                return Ok(PublishOutcome::NoChanges);
            }
            return Err(PipelineError::Publish(format!(
                "git commit failed: {}",
                commit.stderr.trim()
            )));
        }
        info!("Committed changes: {}", message);

        if self.auto_push {
            let mut args = vec!["push"];
            if let Some(remote) = &self.remote {
                args.push(remote.as_str());
                if let Some(branch) = &self.branch {
                    args.push(branch.as_str());
                }
            }
            self.git_checked(&args).await?;
            info!("Pushed changes to remote repository");
        } else {
            info!("Changes committed but not pushed (auto_push disabled)");
        }

        Ok(PublishOutcome::Published)
    }
}
