//! Grading configuration: approval thresholds, concurrency, and retry policy.
//!
//! Sources, lowest precedence first: built-in defaults, a TOML file, then
//! `RUBRIC_*` environment variables. Callers (the CLI) apply flags last.

use std::path::Path;
use std::time::Duration;

use rubric_types::{GradingError, Result};
use serde::{Deserialize, Serialize};

use crate::retry::{BackoffPolicy, RetryPolicy};

/// Configuration for a grading engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingConfig {
    /// Percentages strictly below this require human approval.
    pub failing_threshold: f64,
    /// Percentages strictly above this require human approval.
    pub exceptional_threshold: f64,
    /// Maximum number of evaluators in flight at once.
    pub evaluator_concurrency: usize,
    /// Upper bound on regrade cycles driven by [`run_interactive`](crate::GradingEngine::run_interactive).
    pub max_regrades: usize,
    /// Evaluator notes are folded to one line and truncated to this many characters.
    pub notes_max_chars: usize,
    /// Per-call timeout for command-backed collaborators.
    pub evaluator_timeout_ms: u64,
    pub retry: RetryConfig,
}

/// Retry settings shared by every retry-wrapped stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub initial_delay_ms: u64,
    pub exp_base: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay_ms: 1000,
            exp_base: 7.0,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.attempts.max(1),
            backoff: BackoffPolicy::Exponential {
                initial: Duration::from_millis(self.initial_delay_ms),
                exp_base: self.exp_base,
                max: Duration::from_millis(self.max_delay_ms),
            },
        }
    }
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            failing_threshold: 50.0,
            exceptional_threshold: 90.0,
            evaluator_concurrency: 2,
            max_regrades: 3,
            notes_max_chars: 300,
            evaluator_timeout_ms: 120_000,
            retry: RetryConfig::default(),
        }
    }
}

impl GradingConfig {
    /// Defaults, overlaid with the TOML file at `path` (if any) and then the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_toml_str(&std::fs::read_to_string(p)?)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        Ok(config)
    }

    /// Overlay values from `RUBRIC_*` variables resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RUBRIC_FAILING_THRESHOLD") {
            self.failing_threshold = parse_var("RUBRIC_FAILING_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("RUBRIC_EXCEPTIONAL_THRESHOLD") {
            self.exceptional_threshold = parse_var("RUBRIC_EXCEPTIONAL_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("RUBRIC_EVALUATOR_CONCURRENCY") {
            self.evaluator_concurrency = parse_var("RUBRIC_EVALUATOR_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("RUBRIC_RETRY_ATTEMPTS") {
            self.retry.attempts = parse_var("RUBRIC_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("RUBRIC_RETRY_INITIAL_DELAY_MS") {
            self.retry.initial_delay_ms = parse_var("RUBRIC_RETRY_INITIAL_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("RUBRIC_RETRY_EXP_BASE") {
            self.retry.exp_base = parse_var("RUBRIC_RETRY_EXP_BASE", &v)?;
        }
        if let Some(v) = lookup("RUBRIC_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = parse_var("RUBRIC_RETRY_MAX_DELAY_MS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.failing_threshold.is_finite() || !self.exceptional_threshold.is_finite() {
            return Err(GradingError::Config("thresholds must be finite numbers".into()));
        }
        if self.failing_threshold > self.exceptional_threshold {
            return Err(GradingError::Config(format!(
                "failing_threshold ({}) must not exceed exceptional_threshold ({})",
                self.failing_threshold, self.exceptional_threshold
            )));
        }
        if self.evaluator_concurrency == 0 {
            return Err(GradingError::Config(
                "evaluator_concurrency must be at least 1".into(),
            ));
        }
        if self.notes_max_chars == 0 {
            return Err(GradingError::Config("notes_max_chars must be at least 1".into()));
        }
        if self.retry.attempts == 0 {
            return Err(GradingError::Config("retry.attempts must be at least 1".into()));
        }
        if !self.retry.exp_base.is_finite() || self.retry.exp_base < 1.0 {
            return Err(GradingError::Config("retry.exp_base must be >= 1".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }

    pub fn evaluator_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluator_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GradingError::Config(format!("{name}: cannot parse '{value}'")))
}
