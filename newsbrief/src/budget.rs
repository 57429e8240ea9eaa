use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};

/// Cumulative LLM token usage for one run.
///
/// Crossing the ceiling logs a warning once. With `hard_limit` set, [`TokenBudget::check`]
/// refuses further calls after the ceiling is reached.
#[derive(Debug)]
pub struct TokenBudget {
    limit: usize,
    hard_limit: bool,
    used: AtomicUsize,
    warned: AtomicBool,
}

impl TokenBudget {
    pub fn new(limit: usize, hard_limit: bool) -> Self {
        Self {
            limit,
            hard_limit,
            used: AtomicUsize::new(0),
            warned: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &common::Config) -> Self {
        Self::new(config.daily_tokens(), config.budget_hard_limit())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }

    /// Called before an LLM request.
    pub fn check(&self) -> Result<()> {
        let used = self.used();
        if self.hard_limit && used >= self.limit {
            return Err(PipelineError::BudgetExceeded {
                used,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Add the tokens reported by a finished request.
    pub fn record(&self, tokens: usize) -> usize {
        let used = self.used.fetch_add(tokens, Ordering::Relaxed) + tokens;
        if used > self.limit && !self.warned.swap(true, Ordering::Relaxed) {
            warn!("Token usage {} exceeds the daily target of {}", used, self.limit);
        }
        used
    }

    pub fn log_summary(&self) {
        let used = self.used();
        if used > self.limit {
            warn!("Used {} tokens (target: <{}/day)", used, self.limit);
        } else {
            info!("Token usage within target: {}/{} tokens", used, self.limit);
        }
    }
}
