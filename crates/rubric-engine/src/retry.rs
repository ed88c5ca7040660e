//! Generic retry wrapper shared by every output-producing stage.
//!
//! An inner operation is retried while it fails with an absorbable error or
//! produces an empty output. Once attempts run out the error is converted into
//! a [`FailureRecord`] and returned as data, so one stage's failure never
//! aborts a sibling. Only [`GradingError::BackendUnavailable`] propagates.

use std::future::Future;
use std::time::Duration;

use rubric_types::{EvaluatorOutput, FailureRecord, FinalFeedback, GradingError, Result};

use crate::events::{EventEmitter, GradingEvent};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// `initial * exp_base^(attempt - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        exp_base: f64,
        max: Duration,
    },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Delay to sleep after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential {
                initial,
                exp_base,
                max,
            } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let secs = initial.as_secs_f64() * exp_base.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            initial: Duration::from_secs(1),
            exp_base: 7.0,
            max: Duration::from_secs(10),
        }
    }
}

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately. Used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: BackoffPolicy::None,
        }
    }
}

/// Outputs the retry wrapper can inspect for emptiness.
pub trait StageOutput {
    fn is_empty_output(&self) -> bool;
}

impl StageOutput for EvaluatorOutput {
    fn is_empty_output(&self) -> bool {
        self.notes.trim().is_empty()
    }
}

impl StageOutput for FinalFeedback {
    fn is_empty_output(&self) -> bool {
        self.is_blank()
    }
}

/// Result of a retry-wrapped stage. Exactly one of the two is ever produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Produced { value: T, attempts: u32 },
    Exhausted(FailureRecord),
}

impl<T> RetryOutcome<T> {
    pub fn is_produced(&self) -> bool {
        matches!(self, RetryOutcome::Produced { .. })
    }
}

/// Run `op` under `policy`, writing either a value or a failure record for
/// `output_key`.
///
/// `op` receives the 1-indexed attempt number and starts from scratch each
/// time. Absorbable errors and empty outputs are retried; on exhaustion the
/// last error becomes a [`FailureRecord`] with `recoverable = true`.
pub async fn run_with_retry<T, F, Fut>(
    output_key: &str,
    policy: &RetryPolicy,
    events: &EventEmitter,
    mut op: F,
) -> Result<RetryOutcome<T>>
where
    T: StageOutput,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match op(attempt).await {
            Ok(value) if !value.is_empty_output() => {
                if attempt > 1 {
                    tracing::info!(key = %output_key, attempt, "Recovered after retry");
                }
                return Ok(RetryOutcome::Produced {
                    value,
                    attempts: attempt,
                });
            }
            Ok(_) => GradingError::EmptyOutput {
                key: output_key.to_string(),
            },
            Err(e) if !e.is_absorbable() => return Err(e),
            Err(e) => e,
        };

        if attempt >= max_attempts {
            tracing::warn!(
                key = %output_key,
                attempts = attempt,
                error = %err,
                "Retries exhausted"
            );
            return Ok(RetryOutcome::Exhausted(FailureRecord {
                error_type: err.failure_kind(),
                error_message: err.to_string(),
                recoverable: true,
                attempts: attempt,
                suggestion: Some(format!("Retry {output_key} generation.")),
            }));
        }

        let delay = policy.backoff.delay_for_attempt(attempt);
        tracing::warn!(
            key = %output_key,
            attempt,
            delay_ms = %delay.as_millis(),
            error = %err,
            "Stage output rejected, retrying"
        );
        events.emit(GradingEvent::RetryScheduled {
            key: output_key.to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
            error: err.to_string(),
        });
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
