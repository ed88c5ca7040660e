//! Typed per-session state shared by every stage.
//!
//! Stages never call each other; they read and write this structure. Result
//! slots are keyed by [`GradeKey`] and are write-once per grading attempt.

use std::collections::BTreeMap;

use rubric_types::{
    AggregationResult, CriterionResult, FailureRecord, FinalFeedback, FinalGrade, GradeKey,
    GradingError, Result, Rubric,
};
use serde::{Deserialize, Serialize};

use crate::approval::ApprovalGate;
use crate::validation::ValidationVerdict;

/// Coarse position of a session in the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Validated,
    Evaluating,
    AwaitingApproval,
    /// Feedback was composed for an automatic or approved grade.
    Completed,
    /// A manual override was recorded verbatim.
    Finalized,
    Cancelled,
    Blocked,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub submission: Option<String>,
    pub regrade_comment: Option<String>,
    pub rubric: Option<Rubric>,
    pub validation: Option<ValidationVerdict>,
    /// Result keys the guardrail registered when it built the evaluator set.
    pub expected_keys: Option<Vec<GradeKey>>,
    pub results: BTreeMap<GradeKey, CriterionResult>,
    pub aggregation: Option<AggregationResult>,
    pub approval: ApprovalGate,
    pub feedback: Option<FinalFeedback>,
    pub feedback_error: Option<FailureRecord>,
    pub final_grade: Option<FinalGrade>,
    pub phase: SessionPhase,
}

impl SessionState {
    pub fn is_validated(&self) -> bool {
        self.validation.as_ref().is_some_and(ValidationVerdict::is_valid) && self.rubric.is_some()
    }

    /// Start a new grading attempt with a fresh session id.
    pub fn begin_attempt(&mut self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.session_id = Some(id.clone());
        id
    }

    /// Discard everything produced by the current grading attempt.
    ///
    /// The rubric, its verdict, the expected key set and the submission
    /// survive, so a regrade restarts at the evaluator stage.
    pub fn reset_transient(&mut self) {
        self.session_id = None;
        self.regrade_comment = None;
        self.results.clear();
        self.aggregation = None;
        self.approval = ApprovalGate::default();
        self.feedback = None;
        self.feedback_error = None;
        self.final_grade = None;
        self.phase = if self.is_validated() {
            SessionPhase::Validated
        } else {
            SessionPhase::Idle
        };
    }

    /// Return to the initial empty state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record the single result for `key` in this attempt.
    pub fn record_result(&mut self, key: GradeKey, result: CriterionResult) -> Result<()> {
        if self.results.contains_key(&key) {
            return Err(GradingError::DuplicateResult {
                key: key.to_string(),
            });
        }
        self.results.insert(key, result);
        Ok(())
    }

    /// Every recorded result in rubric order, skipping keys not yet written.
    pub fn grade_snapshot(&self) -> Vec<(GradeKey, CriterionResult)> {
        let keys = match (&self.expected_keys, &self.rubric) {
            (Some(keys), _) => keys.clone(),
            (None, Some(rubric)) => rubric.grade_keys(),
            (None, None) => self.results.keys().cloned().collect(),
        };
        keys.into_iter()
            .filter_map(|k| self.results.get(&k).cloned().map(|r| (k, r)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rubric_types::{Criterion, CriterionGrade};

    fn grade(name: &str, score: f64) -> CriterionResult {
        CriterionResult::Grade(CriterionGrade {
            criterion_name: name.into(),
            max_score: 10.0,
            score,
            notes: "n".into(),
        })
    }

    fn validated_state() -> SessionState {
        let rubric = Rubric::new(
            "r",
            vec![
                Criterion::new("Quality", "q", 10.0),
                Criterion::new("Docs", "d", 10.0),
            ],
        );
        SessionState {
            validation: Some(ValidationVerdict::Valid {
                criteria_count: 2,
                total_points: 20.0,
                message: String::new(),
            }),
            expected_keys: Some(rubric.grade_keys()),
            rubric: Some(rubric),
            submission: Some("print('hi')".into()),
            ..Default::default()
        }
    }

    #[test]
    fn record_result_is_write_once() {
        let mut state = SessionState::default();
        let key = GradeKey::new("quality");
        state.record_result(key.clone(), grade("Quality", 4.0)).unwrap();

        let err = state.record_result(key, grade("Quality", 9.0)).unwrap_err();
        assert!(matches!(err, GradingError::DuplicateResult { .. }));
        assert_eq!(state.results.len(), 1);
    }

    #[test]
    fn reset_transient_keeps_rubric_and_submission() {
        let mut state = validated_state();
        state.begin_attempt();
        state.regrade_comment = Some("look again".into());
        state
            .record_result(GradeKey::new("quality"), grade("Quality", 4.0))
            .unwrap();
        state.feedback = Some(FinalFeedback::default());
        state.phase = SessionPhase::AwaitingApproval;

        state.reset_transient();

        assert!(state.session_id.is_none());
        assert!(state.regrade_comment.is_none());
        assert!(state.results.is_empty());
        assert!(state.feedback.is_none());
        assert!(state.aggregation.is_none());
        assert_eq!(state.approval, ApprovalGate::default());
        assert_eq!(state.phase, SessionPhase::Validated);
        assert!(state.rubric.is_some());
        assert!(state.expected_keys.is_some());
        assert_eq!(state.submission.as_deref(), Some("print('hi')"));
    }

    #[test]
    fn reset_clears_everything() {
        let mut state = validated_state();
        state.reset();
        assert_eq!(state, SessionState::default());
    }

    #[test]
    fn begin_attempt_assigns_fresh_ids() {
        let mut state = SessionState::default();
        let a = state.begin_attempt();
        let b = state.begin_attempt();
        assert_ne!(a, b);
        assert_eq!(state.session_id.as_deref(), Some(b.as_str()));
    }

    #[test]
    fn grade_snapshot_follows_rubric_order() {
        let mut state = validated_state();
        state
            .record_result(GradeKey::new("quality"), grade("Quality", 4.0))
            .unwrap();
        state
            .record_result(GradeKey::new("docs"), grade("Docs", 2.0))
            .unwrap();

        let names: Vec<String> = state
            .grade_snapshot()
            .iter()
            .map(|(_, r)| r.criterion_name().to_string())
            .collect();
        assert_eq!(names, vec!["Quality", "Docs"]);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = validated_state();
        state
            .record_result(GradeKey::new("docs"), grade("Docs", 2.0))
            .unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
