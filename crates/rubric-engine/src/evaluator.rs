//! Per-criterion evaluators and the bounded parallel fan-out that runs them.
//!
//! The evaluator set is rebuilt wholesale from a validated rubric by
//! [`build_evaluators`]; it is never patched in place. Each evaluator runs
//! under the retry wrapper, so a failing criterion produces a failure record
//! instead of aborting its siblings.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rubric_types::{
    single_line, Criterion, CriterionGrade, CriterionResult, EvaluatorOutput, GradeKey,
    GradingError, Result, Rubric,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::GradingConfig;
use crate::events::{EventEmitter, GradingEvent};
use crate::retry::{run_with_retry, RetryOutcome};

/// Everything an evaluator is told about one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub criterion_name: String,
    pub description: String,
    pub max_score: f64,
    pub submission: String,
    /// Reviewer comment carried into a regrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regrade_comment: Option<String>,
}

/// The external collaborator that scores one criterion.
///
/// Implementations must tolerate concurrent calls; the engine bounds how many
/// are in flight.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluatorOutput>;
}

/// An evaluator bound to one rubric criterion.
#[derive(Clone)]
pub struct CriterionEvaluator {
    criterion: Criterion,
    backend: Arc<dyn Evaluator>,
}

impl CriterionEvaluator {
    pub fn criterion(&self) -> &Criterion {
        &self.criterion
    }

    pub fn key(&self) -> GradeKey {
        self.criterion.grade_key()
    }

    pub fn request(&self, submission: &str, regrade_comment: Option<&str>) -> EvaluationRequest {
        EvaluationRequest {
            criterion_name: self.criterion.name.clone(),
            description: self.criterion.description.clone(),
            max_score: self.criterion.max_score,
            submission: submission.to_string(),
            regrade_comment: regrade_comment.map(str::to_string),
        }
    }

    /// Call the backend once and normalize what it returns.
    pub async fn evaluate(
        &self,
        request: &EvaluationRequest,
        notes_max_chars: usize,
    ) -> Result<EvaluatorOutput> {
        let output = self.backend.evaluate(request).await?;
        normalize_output(&self.key(), output, notes_max_chars)
    }
}

/// Reject non-finite scores and fold notes onto one bounded line.
pub fn normalize_output(
    key: &GradeKey,
    output: EvaluatorOutput,
    notes_max_chars: usize,
) -> Result<EvaluatorOutput> {
    if !output.score.is_finite() {
        return Err(GradingError::SchemaViolation(format!(
            "score for '{key}' is not a finite number"
        )));
    }
    Ok(EvaluatorOutput {
        score: output.score,
        notes: single_line(&output.notes, notes_max_chars),
    })
}

/// The concrete evaluators for one validated rubric.
#[derive(Clone)]
pub struct EvaluatorSet {
    rubric: Rubric,
    evaluators: Vec<CriterionEvaluator>,
}

impl EvaluatorSet {
    pub fn keys(&self) -> Vec<GradeKey> {
        self.evaluators.iter().map(CriterionEvaluator::key).collect()
    }

    pub fn evaluators(&self) -> &[CriterionEvaluator] {
        &self.evaluators
    }

    pub fn len(&self) -> usize {
        self.evaluators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }

    /// Whether this set was built from `rubric`.
    pub fn is_for(&self, rubric: &Rubric) -> bool {
        &self.rubric == rubric
    }
}

/// One evaluator per criterion, in rubric order.
pub fn build_evaluators(rubric: &Rubric, backend: Arc<dyn Evaluator>) -> EvaluatorSet {
    let evaluators = rubric
        .criteria
        .iter()
        .map(|criterion| CriterionEvaluator {
            criterion: criterion.clone(),
            backend: Arc::clone(&backend),
        })
        .collect();
    EvaluatorSet {
        rubric: rubric.clone(),
        evaluators,
    }
}

/// Run every evaluator in `set` with at most `config.evaluator_concurrency`
/// in flight.
///
/// Returns `Ok(None)` when `cancel` fires first; whatever finished is then
/// discarded. Results arrive in completion order and are keyed, so callers
/// must not rely on ordering. A backend outage aborts the batch with
/// [`GradingError::BackendUnavailable`].
pub async fn run_evaluators(
    set: &EvaluatorSet,
    submission: &str,
    regrade_comment: Option<&str>,
    config: &GradingConfig,
    events: &EventEmitter,
    cancel: &CancellationToken,
) -> Result<Option<Vec<(GradeKey, CriterionResult)>>> {
    let started = Instant::now();
    let sem = Arc::new(Semaphore::new(config.evaluator_concurrency.max(1)));
    let policy = config.retry_policy();
    let notes_max_chars = config.notes_max_chars;

    let mut tasks = JoinSet::new();
    for evaluator in set.evaluators() {
        let evaluator = evaluator.clone();
        let request = evaluator.request(submission, regrade_comment);
        let sem = Arc::clone(&sem);
        let policy = policy.clone();
        let events = events.clone();

        tasks.spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            let key = evaluator.key();
            let outcome = run_with_retry(&key.to_string(), &policy, &events, |attempt| {
                let evaluator = evaluator.clone();
                let request = request.clone();
                async move {
                    tracing::debug!(key = %evaluator.key(), attempt, "Evaluating criterion");
                    evaluator.evaluate(&request, notes_max_chars).await
                }
            })
            .await;
            (evaluator.criterion().clone(), outcome)
        });
    }

    let mut results = Vec::with_capacity(set.len());
    loop {
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(in_flight = tasks.len(), "Evaluation cancelled, discarding results");
                tasks.abort_all();
                return Ok(None);
            }
            joined = tasks.join_next() => joined,
        };
        let Some(joined) = joined else { break };

        let (criterion, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                // The key stays unwritten and is reported as missing.
                tracing::warn!(error = %e, "Evaluator task did not complete");
                continue;
            }
        };
        let key = criterion.grade_key();
        let result = match outcome {
            Ok(RetryOutcome::Produced { value, attempts }) => {
                let grade = CriterionGrade::from_output(&criterion, value);
                tracing::info!(key = %key, score = grade.score, attempts, "Criterion graded");
                events.emit(GradingEvent::CriterionGraded {
                    key: key.to_string(),
                    score: grade.score,
                    max_score: grade.max_score,
                });
                CriterionResult::Grade(grade)
            }
            Ok(RetryOutcome::Exhausted(failure)) => {
                tracing::warn!(
                    key = %key,
                    error_key = %key.error_key(),
                    error = %failure.error_message,
                    "Criterion failed to grade"
                );
                events.emit(GradingEvent::CriterionFailed {
                    key: key.to_string(),
                    error: failure.error_message.clone(),
                });
                CriterionResult::Failure {
                    criterion_name: criterion.name.clone(),
                    max_score: criterion.max_score,
                    failure,
                }
            }
            Err(e) => {
                tasks.abort_all();
                return Err(e);
            }
        };
        results.push((key, result));
    }

    tracing::info!(
        criteria = results.len(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Evaluator batch finished"
    );
    Ok(Some(results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rubric_types::FailureKind;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::config::RetryConfig;

    /// Scores by criterion name; unknown names fail validation.
    struct TableEvaluator {
        scores: HashMap<String, f64>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl TableEvaluator {
        fn new(scores: &[(&str, f64)]) -> Self {
            Self {
                scores: scores.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Evaluator for TableEvaluator {
        async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluatorOutput> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.scores.get(&request.criterion_name) {
                Some(score) => Ok(EvaluatorOutput {
                    score: *score,
                    notes: format!("notes for\n{}", request.criterion_name),
                }),
                None => Err(GradingError::SchemaViolation("no score".into())),
            }
        }
    }

    fn rubric(names: &[(&str, f64)]) -> Rubric {
        Rubric::new(
            "r",
            names
                .iter()
                .map(|(n, m)| Criterion::new(*n, "d", *m))
                .collect(),
        )
    }

    fn fast_config() -> GradingConfig {
        GradingConfig {
            retry: RetryConfig {
                attempts: 2,
                initial_delay_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn build_creates_one_evaluator_per_criterion() {
        let r = rubric(&[("Quality", 50.0), ("Docs", 50.0), ("Tests", 20.0)]);
        let set = build_evaluators(&r, Arc::new(TableEvaluator::new(&[])));
        assert_eq!(set.len(), 3);
        assert_eq!(
            set.keys(),
            vec![
                GradeKey::new("quality"),
                GradeKey::new("docs"),
                GradeKey::new("tests")
            ]
        );
        assert!(set.is_for(&r));
    }

    #[test]
    fn normalize_rejects_non_finite_scores() {
        let err = normalize_output(
            &GradeKey::new("q"),
            EvaluatorOutput {
                score: f64::NAN,
                notes: "x".into(),
            },
            100,
        )
        .unwrap_err();
        assert!(matches!(err, GradingError::SchemaViolation(_)));
    }

    #[test]
    fn normalize_folds_and_truncates_notes() {
        let out = normalize_output(
            &GradeKey::new("q"),
            EvaluatorOutput {
                score: 1.0,
                notes: "line one\nline two".into(),
            },
            8,
        )
        .unwrap();
        assert_eq!(out.notes, "line one");
    }

    #[tokio::test]
    async fn fan_out_grades_every_criterion_and_isolates_failures() {
        let r = rubric(&[("Quality", 50.0), ("Docs", 50.0)]);
        let set = build_evaluators(&r, Arc::new(TableEvaluator::new(&[("Quality", 60.0)])));

        let results = run_evaluators(
            &set,
            "fn main() {}",
            None,
            &fast_config(),
            &EventEmitter::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
        .unwrap();

        let by_key: HashMap<GradeKey, CriterionResult> = results.into_iter().collect();
        assert_eq!(by_key.len(), 2);
        match &by_key[&GradeKey::new("quality")] {
            CriterionResult::Grade(g) => {
                assert_eq!(g.score, 50.0);
                assert_eq!(g.notes, "notes for Quality");
            }
            other => panic!("expected grade, got {:?}", other),
        }
        match &by_key[&GradeKey::new("docs")] {
            CriterionResult::Failure { failure, .. } => {
                assert_eq!(failure.error_type, FailureKind::Validation);
                assert_eq!(failure.attempts, 2);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let names = [("A", 1.0), ("B", 1.0), ("C", 1.0), ("D", 1.0), ("E", 1.0)];
        let backend = Arc::new(TableEvaluator::new(&names));
        let set = build_evaluators(&rubric(&names), backend.clone());

        let config = GradingConfig {
            evaluator_concurrency: 2,
            ..fast_config()
        };
        run_evaluators(
            &set,
            "s",
            None,
            &config,
            &EventEmitter::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelled_batch_returns_none() {
        let r = rubric(&[("Quality", 50.0)]);
        let set = build_evaluators(&r, Arc::new(TableEvaluator::new(&[("Quality", 1.0)])));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = run_evaluators(
            &set,
            "s",
            None,
            &fast_config(),
            &EventEmitter::default(),
            &cancel,
        )
        .await
        .unwrap();
        assert!(results.is_none());
    }

    #[tokio::test]
    async fn backend_outage_aborts_batch() {
        struct Down;

        #[async_trait]
        impl Evaluator for Down {
            async fn evaluate(&self, _: &EvaluationRequest) -> Result<EvaluatorOutput> {
                Err(GradingError::BackendUnavailable("connection refused".into()))
            }
        }

        let set = build_evaluators(&rubric(&[("Quality", 5.0)]), Arc::new(Down));
        let err = run_evaluators(
            &set,
            "s",
            None,
            &fast_config(),
            &EventEmitter::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GradingError::BackendUnavailable(_)));
    }
}
