//! The grading pipeline driver.
//!
//! Stages run strictly in order (validate, evaluate, aggregate, approve,
//! feedback) and communicate only through [`SessionState`]. The pipeline
//! suspends at exactly one point, a pending approval, and is resumed by
//! injecting a [`Decision`] against the pending invocation id.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rubric_types::{
    round1, AggregationResult, ApprovalState, CriterionResult, Decision, FailureRecord,
    FinalFeedback, FinalGrade, GradeKey, GradeSource, GradingError, PendingApproval, Result,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::aggregator::aggregate;
use crate::checkpoint::{clear_checkpoint, load_checkpoint, save_checkpoint, SessionCheckpoint};
use crate::config::GradingConfig;
use crate::evaluator::{run_evaluators, Evaluator, EvaluatorSet};
use crate::events::{EventEmitter, GradingEvent};
use crate::feedback::{compose_feedback, FeedbackComposer, FeedbackRequest, SummaryComposer};
use crate::guardrail::{self, BlockReport, Stage};
use crate::interviewer::ApprovalInterviewer;
use crate::retry::RetryOutcome;
use crate::session::{SessionPhase, SessionState};
use crate::validation::validate_rubric;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Everything a finished grading attempt produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingReport {
    pub session_id: Option<String>,
    pub rubric_name: Option<String>,
    pub aggregation: Option<AggregationResult>,
    pub results: Vec<(GradeKey, CriterionResult)>,
    pub feedback: Option<FinalFeedback>,
    pub feedback_error: Option<FailureRecord>,
    pub final_grade: Option<FinalGrade>,
    pub approval: ApprovalState,
}

impl GradingReport {
    fn from_state(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            rubric_name: state.rubric.as_ref().map(|r| r.name.clone()),
            aggregation: state.aggregation.clone(),
            results: state.grade_snapshot(),
            feedback: state.feedback.clone(),
            feedback_error: state.feedback_error.clone(),
            final_grade: state.final_grade.clone(),
            approval: state.approval.state(),
        }
    }
}

/// How a call into the pipeline ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Feedback was produced, or a manual override was recorded.
    Completed(GradingReport),
    /// Waiting on a human decision for this request.
    Suspended(PendingApproval),
    /// A protected stage refused to run.
    Blocked(BlockReport),
    Cancelled,
}

// ---------------------------------------------------------------------------
// GradingSession
// ---------------------------------------------------------------------------

struct SessionInner {
    state: Mutex<SessionState>,
    evaluators: Mutex<Option<EvaluatorSet>>,
    active: AtomicBool,
    cancel: std::sync::Mutex<CancellationToken>,
}

/// Shared handle to one grading session. Clones refer to the same session.
///
/// Only one pipeline call may be active per session at a time.
#[derive(Clone)]
pub struct GradingSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for GradingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GradingSession").finish_non_exhaustive()
    }
}

impl Default for GradingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl GradingSession {
    pub fn new() -> Self {
        Self::from_state(SessionState::default())
    }

    /// Rehydrate a session, e.g. from a checkpoint.
    pub fn from_state(state: SessionState) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(state),
                evaluators: Mutex::new(None),
                active: AtomicBool::new(false),
                cancel: std::sync::Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// A copy of the current state.
    pub async fn snapshot(&self) -> SessionState {
        self.inner.state.lock().await.clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Cancel the session.
    ///
    /// An active attempt is signalled and resets itself when it observes the
    /// signal. A session suspended at the approval gate is reset and marked
    /// cancelled immediately. Returns `false` when there was nothing to cancel.
    pub async fn cancel(&self) -> bool {
        if self.cancel_active() {
            return true;
        }
        let mut state = self.inner.state.lock().await;
        if !state.approval.is_pending() {
            return false;
        }
        state.reset_transient();
        state.approval.cancel();
        state.phase = SessionPhase::Cancelled;
        tracing::info!("Suspended session cancelled");
        true
    }

    /// Cancel the token of the active attempt, if there is one.
    fn cancel_active(&self) -> bool {
        let slot = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !self.is_active() {
            return false;
        }
        slot.cancel();
        true
    }

    /// Mark the session active and install a fresh cancel token.
    ///
    /// Both happen under the token lock, so a concurrent `cancel` either sees
    /// an idle session or cancels the new token.
    fn begin(&self) -> Result<(ActiveGuard, CancellationToken)> {
        let mut slot = self
            .inner
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return Err(GradingError::SessionBusy);
        }
        let token = CancellationToken::new();
        *slot = token.clone();
        Ok((
            ActiveGuard {
                inner: Arc::clone(&self.inner),
            },
            token,
        ))
    }
}

struct ActiveGuard {
    inner: Arc<SessionInner>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.active.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// GradingEngine
// ---------------------------------------------------------------------------

/// Runs the grading pipeline against sessions.
#[derive(Clone)]
pub struct GradingEngine {
    config: GradingConfig,
    evaluator: Arc<dyn Evaluator>,
    composer: Arc<dyn FeedbackComposer>,
    events: EventEmitter,
    checkpoint_dir: Option<PathBuf>,
}

impl GradingEngine {
    /// An engine with the local [`SummaryComposer`] for feedback.
    pub fn new(config: GradingConfig, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            config,
            evaluator,
            composer: Arc::new(SummaryComposer),
            events: EventEmitter::default(),
            checkpoint_dir: None,
        }
    }

    pub fn with_composer(mut self, composer: Arc<dyn FeedbackComposer>) -> Self {
        self.composer = composer;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Persist a checkpoint to `dir` whenever the pipeline suspends.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &GradingConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Validate `raw_rubric`, then grade `submission` against it.
    ///
    /// Any previous attempt on the session is discarded first.
    pub async fn run(
        &self,
        session: &GradingSession,
        raw_rubric: &str,
        submission: &str,
    ) -> Result<PipelineOutcome> {
        let (_guard, token) = session.begin()?;
        let result = self.start(session, raw_rubric, submission, &token).await;
        self.settle_checkpoint(result).await
    }

    async fn start(
        &self,
        session: &GradingSession,
        raw_rubric: &str,
        submission: &str,
        token: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        {
            let mut state = session.inner.state.lock().await;
            let started = Instant::now();
            self.events.emit(GradingEvent::StageStarted {
                stage: Stage::Validate,
            });
            let verdict = validate_rubric(&mut state, raw_rubric);
            self.stage_completed(Stage::Validate, started);

            state.reset_transient();
            if verdict.is_valid() && submission.trim().is_empty() {
                return Err(GradingError::Validation(vec![
                    "Submission cannot be empty".to_string(),
                ]));
            }
            state.submission = Some(submission.to_string());
            let session_id = state.begin_attempt();
            tracing::info!(session_id = %session_id, "Grading attempt started");
        }
        self.run_attempt(session, token).await
    }

    /// Apply a human decision to the session's pending approval.
    pub async fn resume(
        &self,
        session: &GradingSession,
        invocation_id: &str,
        decision: Decision,
    ) -> Result<PipelineOutcome> {
        let (_guard, token) = session.begin()?;
        let result = self.apply_decision(session, invocation_id, decision, &token).await;
        self.settle_checkpoint(result).await
    }

    /// Load the checkpoint in `dir` and resume it with `decision`.
    ///
    /// The checkpoint must belong to `invocation_id`. It is removed once the
    /// session leaves the approval gate, and rewritten for the new request
    /// when a regrade suspends again.
    pub async fn resume_from_checkpoint(
        &self,
        dir: &Path,
        invocation_id: &str,
        decision: Decision,
    ) -> Result<(GradingSession, PipelineOutcome)> {
        let checkpoint = load_checkpoint(dir)
            .await?
            .filter(|cp| cp.invocation_id == invocation_id)
            .ok_or_else(|| GradingError::InvocationNotFound(invocation_id.to_string()))?;
        tracing::info!(
            invocation_id,
            session_id = checkpoint.session_id.as_deref().unwrap_or("-"),
            saved_at = %checkpoint.timestamp,
            "Resuming from checkpoint"
        );

        let session = GradingSession::from_state(checkpoint.state);
        let outcome = self.resume(&session, invocation_id, decision).await?;
        match &outcome {
            // A regrade that suspends again replaces the checkpoint, unless
            // run_attempt already wrote it to this directory.
            PipelineOutcome::Suspended(pending)
                if self.checkpoint_dir.as_deref() != Some(dir) =>
            {
                let checkpoint = SessionCheckpoint::new(
                    pending.invocation_id.clone(),
                    Stage::Approve,
                    session.snapshot().await,
                );
                let path = save_checkpoint(&checkpoint, dir).await?;
                self.events.emit(GradingEvent::CheckpointSaved {
                    invocation_id: pending.invocation_id.clone(),
                    path: path.display().to_string(),
                });
            }
            PipelineOutcome::Suspended(_) => {}
            _ => clear_checkpoint(dir).await?,
        }
        Ok((session, outcome))
    }

    /// Run and keep asking `interviewer` until the pipeline stops suspending.
    ///
    /// After `max_regrades` regrade cycles a further pending request is
    /// returned as [`PipelineOutcome::Suspended`] instead of asked again.
    pub async fn run_interactive(
        &self,
        session: &GradingSession,
        raw_rubric: &str,
        submission: &str,
        interviewer: &dyn ApprovalInterviewer,
    ) -> Result<PipelineOutcome> {
        let mut outcome = self.run(session, raw_rubric, submission).await?;
        let mut regrades = 0;
        loop {
            let PipelineOutcome::Suspended(pending) = outcome else {
                return Ok(outcome);
            };
            if regrades >= self.config.max_regrades {
                tracing::warn!(regrades, "Regrade limit reached, leaving approval pending");
                return Ok(PipelineOutcome::Suspended(pending));
            }
            let decision = interviewer.decide(&pending).await?;
            if matches!(decision, Decision::Regrade { .. }) {
                regrades += 1;
            }
            outcome = self
                .resume(session, &pending.invocation_id, decision)
                .await?;
        }
    }

    /// Cancel `session`, emitting the cancellation when it took effect
    /// immediately.
    pub async fn cancel(&self, session: &GradingSession) -> Result<bool> {
        let was_active = session.is_active();
        let cancelled = session.cancel().await;
        if cancelled && !was_active {
            self.events.emit(GradingEvent::GradingCancelled);
            if let Some(dir) = &self.checkpoint_dir {
                clear_checkpoint(dir).await?;
            }
        }
        Ok(cancelled)
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    /// Evaluate, aggregate and gate one attempt.
    async fn run_attempt(
        &self,
        session: &GradingSession,
        token: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let started = Instant::now();
        let (set, submission, comment) = {
            let mut state = session.inner.state.lock().await;
            let mut current = session.inner.evaluators.lock().await;
            if let Err(report) =
                guardrail::before_stage(Stage::Evaluate, &mut state, &mut current, &self.evaluator)
            {
                return Ok(self.blocked(&mut state, report));
            }
            let Some(set) = current.clone() else {
                return Err(GradingError::Other("evaluator set was not built".into()));
            };
            state.phase = SessionPhase::Evaluating;
            (
                set,
                state.submission.clone().unwrap_or_default(),
                state.regrade_comment.clone(),
            )
        };
        self.events.emit(GradingEvent::StageStarted {
            stage: Stage::Evaluate,
        });
        tracing::info!(evaluators = set.len(), "Running evaluators");

        let batch = run_evaluators(
            &set,
            &submission,
            comment.as_deref(),
            &self.config,
            &self.events,
            token,
        )
        .await;

        let mut state = session.inner.state.lock().await;
        let results = match batch {
            Ok(Some(results)) if !token.is_cancelled() => results,
            Ok(_) => return Ok(self.cancelled(&mut state)),
            Err(e) => {
                drop(state);
                return Err(self.abort(session, e).await);
            }
        };
        for (key, result) in results {
            state.record_result(key, result)?;
        }
        self.stage_completed(Stage::Evaluate, started);

        // Aggregate
        let started = Instant::now();
        if let Err(report) = guardrail::check(Stage::Aggregate, &state) {
            return Ok(self.blocked(&mut state, report));
        }
        self.events.emit(GradingEvent::StageStarted {
            stage: Stage::Aggregate,
        });
        let aggregation = aggregate(&state, &self.config)?;
        self.events.emit(GradingEvent::AggregationProduced {
            total_score: aggregation.total_score,
            max_possible: aggregation.max_possible,
            percentage: aggregation.percentage,
            letter_grade: aggregation.letter_grade,
            requires_human_approval: aggregation.requires_human_approval,
        });
        state.aggregation = Some(aggregation.clone());
        self.stage_completed(Stage::Aggregate, started);

        // Approve
        if let Err(report) = guardrail::check(Stage::Approve, &state) {
            return Ok(self.blocked(&mut state, report));
        }
        if state.approval.observe(&aggregation) {
            state.phase = SessionPhase::AwaitingApproval;
            let Some(pending) = state.approval.take_notification() else {
                return Err(GradingError::Other("approval request was not recorded".into()));
            };
            tracing::info!(
                invocation_id = %pending.invocation_id,
                percentage = aggregation.percentage,
                reason = aggregation.approval_reason.as_deref().unwrap_or(""),
                "Grade requires human approval"
            );
            self.events.emit(GradingEvent::ApprovalRequested {
                invocation_id: pending.invocation_id.clone(),
                reason: aggregation.approval_reason.clone(),
            });
            if let Some(dir) = &self.checkpoint_dir {
                let checkpoint = SessionCheckpoint::new(
                    pending.invocation_id.clone(),
                    Stage::Approve,
                    state.clone(),
                );
                let path = save_checkpoint(&checkpoint, dir).await?;
                self.events.emit(GradingEvent::CheckpointSaved {
                    invocation_id: pending.invocation_id.clone(),
                    path: path.display().to_string(),
                });
            }
            return Ok(PipelineOutcome::Suspended(pending));
        }
        drop(state);

        self.finish_with_feedback(session, GradeSource::Automatic, token)
            .await
    }

    async fn apply_decision(
        &self,
        session: &GradingSession,
        invocation_id: &str,
        decision: Decision,
        token: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let mut state = session.inner.state.lock().await;
        state.approval.decide(invocation_id, &decision)?;
        self.events.emit(GradingEvent::ApprovalResolved {
            invocation_id: invocation_id.to_string(),
            decision: decision.name().to_string(),
        });

        match decision {
            Decision::Approve => {
                drop(state);
                self.finish_with_feedback(session, GradeSource::Approved, token)
                    .await
            }
            Decision::ManualAdjust {
                score,
                letter_grade,
                feedback_text,
            } => {
                let max_score = state
                    .aggregation
                    .as_ref()
                    .map(|a| a.max_possible)
                    .or_else(|| state.rubric.as_ref().map(|r| r.total_points()))
                    .unwrap_or(0.0);
                let percentage = if max_score > 0.0 {
                    round1(score / max_score * 100.0)
                } else {
                    0.0
                };
                state.feedback = None;
                state.feedback_error = None;
                state.final_grade = Some(FinalGrade {
                    score,
                    max_score,
                    percentage,
                    letter_grade,
                    source: GradeSource::ManualOverride,
                    feedback_text: Some(feedback_text),
                });
                state.phase = SessionPhase::Finalized;
                let session_id = state.session_id.clone().unwrap_or_default();
                tracing::info!(session_id = %session_id, score, "Manual override recorded");
                self.events.emit(GradingEvent::GradingFinalized {
                    session_id,
                    source: GradeSource::ManualOverride,
                });
                Ok(PipelineOutcome::Completed(GradingReport::from_state(&state)))
            }
            Decision::Regrade { comment } => {
                state.reset_transient();
                state.regrade_comment = comment;
                self.events.emit(GradingEvent::SessionReset {
                    reason: "regrade requested".into(),
                });
                let session_id = state.begin_attempt();
                tracing::info!(session_id = %session_id, "Regrading with the same submission");
                drop(state);
                self.run_attempt(session, token).await
            }
            Decision::Cancel => {
                let outcome = self.cancelled(&mut state);
                state.approval.cancel();
                Ok(outcome)
            }
        }
    }

    /// Compose feedback for the stored aggregation and complete the attempt.
    ///
    /// The aggregation is used as is; it is never recomputed here. A
    /// cancellation observed before the grade is committed discards it.
    async fn finish_with_feedback(
        &self,
        session: &GradingSession,
        source: GradeSource,
        token: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let started = Instant::now();
        let request = {
            let mut state = session.inner.state.lock().await;
            if let Err(report) = guardrail::check(Stage::Feedback, &state) {
                return Ok(self.blocked(&mut state, report));
            }
            let Some(aggregation) = state.aggregation.clone() else {
                return Err(GradingError::Other("no aggregation to compose feedback for".into()));
            };
            FeedbackRequest {
                rubric_name: state.rubric.as_ref().map(|r| r.name.clone()).unwrap_or_default(),
                submission: state.submission.clone().unwrap_or_default(),
                aggregation,
            }
        };
        self.events.emit(GradingEvent::StageStarted {
            stage: Stage::Feedback,
        });

        let retry_policy = self.config.retry_policy();
        let composed = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = compose_feedback(
                self.composer.as_ref(),
                &request,
                &retry_policy,
                &self.events,
            ) => Some(result),
        };
        let outcome = match composed {
            Some(Ok(outcome)) => outcome,
            Some(Err(e)) => return Err(self.abort(session, e).await),
            None => {
                let mut state = session.inner.state.lock().await;
                let outcome = self.cancelled(&mut state);
                state.approval.cancel();
                return Ok(outcome);
            }
        };

        let mut state = session.inner.state.lock().await;
        if token.is_cancelled() {
            let outcome = self.cancelled(&mut state);
            state.approval.cancel();
            return Ok(outcome);
        }
        match outcome {
            RetryOutcome::Produced { value, .. } => state.feedback = Some(value),
            RetryOutcome::Exhausted(record) => {
                tracing::warn!(error = %record.error_message, "Feedback could not be composed");
                state.feedback_error = Some(record);
            }
        }
        let agg = &request.aggregation;
        state.final_grade = Some(FinalGrade {
            score: agg.total_score,
            max_score: agg.max_possible,
            percentage: agg.percentage,
            letter_grade: agg.letter_grade.to_string(),
            source,
            feedback_text: None,
        });
        state.phase = SessionPhase::Completed;
        self.stage_completed(Stage::Feedback, started);

        let session_id = state.session_id.clone().unwrap_or_default();
        tracing::info!(
            session_id = %session_id,
            percentage = agg.percentage,
            letter = %agg.letter_grade,
            "Grading completed"
        );
        self.events.emit(GradingEvent::GradingCompleted {
            session_id,
            percentage: agg.percentage,
        });
        Ok(PipelineOutcome::Completed(GradingReport::from_state(&state)))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn blocked(&self, state: &mut SessionState, report: BlockReport) -> PipelineOutcome {
        state.phase = SessionPhase::Blocked;
        self.events.emit(GradingEvent::StageBlocked {
            stage: report.stage,
            errors: report.errors.clone(),
        });
        PipelineOutcome::Blocked(report)
    }

    fn cancelled(&self, state: &mut SessionState) -> PipelineOutcome {
        state.reset_transient();
        state.phase = SessionPhase::Cancelled;
        tracing::info!("Grading attempt cancelled");
        self.events.emit(GradingEvent::GradingCancelled);
        PipelineOutcome::Cancelled
    }

    /// Reset the whole session after an error that aborts the attempt.
    async fn abort(&self, session: &GradingSession, err: GradingError) -> GradingError {
        tracing::warn!(error = %err, "Grading attempt aborted, resetting session");
        session.inner.state.lock().await.reset();
        *session.inner.evaluators.lock().await = None;
        self.events.emit(GradingEvent::SessionReset {
            reason: err.to_string(),
        });
        err
    }

    fn stage_completed(&self, stage: Stage, started: Instant) {
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(stage = %stage, duration_ms, "Stage completed");
        self.events
            .emit(GradingEvent::StageCompleted { stage, duration_ms });
    }

    /// Drop a stale checkpoint once the session is no longer suspended.
    async fn settle_checkpoint(&self, result: Result<PipelineOutcome>) -> Result<PipelineOutcome> {
        if let Some(dir) = &self.checkpoint_dir {
            if !matches!(result, Ok(PipelineOutcome::Suspended(_))) {
                if let Err(e) = clear_checkpoint(dir).await {
                    tracing::warn!(path = %dir.display(), error = %e, "Failed to clear checkpoint");
                }
            }
        }
        result
    }
}
