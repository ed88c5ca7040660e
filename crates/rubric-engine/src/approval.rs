//! Approval gate state machine.
//!
//! `None -> Pending` when an aggregation needs a human, then exactly one of
//! `Approved`, `ManualOverride`, `RegradeRequested` or `Cancelled`. Whether the
//! pending request has already been surfaced is tracked apart from the state
//! so re-observing it never notifies twice.

use rubric_types::{
    AggregationResult, ApprovalPayload, ApprovalState, Decision, GradeStatus, GradingError,
    PendingApproval, Result,
};
use serde::{Deserialize, Serialize};

use crate::validation::format_points;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalGate {
    state: ApprovalState,
    pending: Option<PendingApproval>,
    surfaced: bool,
}

impl ApprovalGate {
    pub fn state(&self) -> ApprovalState {
        self.state
    }

    /// The outstanding request, present only while `Pending`.
    pub fn pending(&self) -> Option<&PendingApproval> {
        self.pending.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.state == ApprovalState::Pending
    }

    /// Feed an aggregation into the gate.
    ///
    /// Returns `true` only on the `None -> Pending` transition. Aggregations
    /// that need no approval, and repeated observations, leave the gate as is.
    pub fn observe(&mut self, aggregation: &AggregationResult) -> bool {
        if !aggregation.requires_human_approval || self.state != ApprovalState::None {
            return false;
        }
        self.state = ApprovalState::Pending;
        self.surfaced = false;
        self.pending = Some(PendingApproval {
            invocation_id: uuid::Uuid::new_v4().to_string(),
            hint: approval_hint(aggregation),
            payload: ApprovalPayload {
                final_score: aggregation.total_score,
                percentage: aggregation.percentage,
                letter_grade: aggregation.letter_grade,
            },
        });
        true
    }

    /// Hand out the pending request the first time it is asked for.
    pub fn take_notification(&mut self) -> Option<PendingApproval> {
        if self.state != ApprovalState::Pending || self.surfaced {
            return None;
        }
        self.surfaced = true;
        self.pending.clone()
    }

    /// Apply a human decision to the pending request identified by
    /// `invocation_id`, returning the new state.
    pub fn decide(&mut self, invocation_id: &str, decision: &Decision) -> Result<ApprovalState> {
        if self.state != ApprovalState::Pending {
            return Err(GradingError::InvalidTransition {
                from: self.state.to_string(),
                decision: decision.name().to_string(),
            });
        }
        match &self.pending {
            Some(p) if p.invocation_id == invocation_id => {}
            _ => return Err(GradingError::InvocationNotFound(invocation_id.to_string())),
        }

        self.state = match decision {
            Decision::Approve => ApprovalState::Approved,
            Decision::ManualAdjust { .. } => ApprovalState::ManualOverride,
            Decision::Regrade { .. } => ApprovalState::RegradeRequested,
            Decision::Cancel => ApprovalState::Cancelled,
        };
        self.pending = None;
        tracing::info!(
            invocation_id,
            decision = decision.name(),
            state = %self.state,
            "Approval decision applied"
        );
        Ok(self.state)
    }

    /// Mark the gate cancelled outside of a human decision.
    pub(crate) fn cancel(&mut self) {
        self.state = ApprovalState::Cancelled;
        self.pending = None;
    }
}

/// Human-readable summary shown to the reviewer.
pub fn approval_hint(aggregation: &AggregationResult) -> String {
    let mut summary = String::new();
    for d in &aggregation.grade_details {
        let line = match d.status {
            GradeStatus::Graded => format!(
                "- {}: {}/{} ({:.1}%)",
                d.criterion,
                format_points(d.score),
                format_points(d.max_score),
                d.percentage
            ),
            GradeStatus::Failed => format!(
                "- {}: FAILED (0/{})",
                d.criterion,
                format_points(d.max_score)
            ),
            GradeStatus::Missing => format!(
                "- {}: MISSING (0/{})",
                d.criterion,
                format_points(d.max_score)
            ),
        };
        summary.push_str(&line);
        summary.push('\n');
    }

    format!(
        "GRADE APPROVAL REQUIRED\n\n\
         Final Score: {}/{} ({:.1}%) - Grade: {}\n\n\
         Reason: {}\n\n\
         Grade Summary:\n{}\n\
         Do you approve this grade?",
        format_points(aggregation.total_score),
        format_points(aggregation.max_possible),
        aggregation.percentage,
        aggregation.letter_grade,
        aggregation.approval_reason.as_deref().unwrap_or("Review requested"),
        summary,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rubric_types::{GradeDetail, GradeKey, LetterGrade};

    fn aggregation(requires: bool) -> AggregationResult {
        AggregationResult {
            total_score: 95.0,
            max_possible: 100.0,
            percentage: 95.0,
            letter_grade: LetterGrade::A,
            grade_details: vec![
                GradeDetail {
                    criterion: "Quality".into(),
                    key: GradeKey::new("quality"),
                    score: 48.0,
                    max_score: 50.0,
                    percentage: 96.0,
                    justification: "clean".into(),
                    status: GradeStatus::Graded,
                },
                GradeDetail {
                    criterion: "Docs".into(),
                    key: GradeKey::new("docs"),
                    score: 0.0,
                    max_score: 50.0,
                    percentage: 0.0,
                    justification: String::new(),
                    status: GradeStatus::Failed,
                },
            ],
            requires_human_approval: requires,
            approval_reason: requires.then(|| "Score 95.0% is exceptional".to_string()),
            failed_criteria: vec![],
            missing_grade_keys: vec![],
            message: String::new(),
        }
    }

    fn pending_gate() -> (ApprovalGate, String) {
        let mut gate = ApprovalGate::default();
        assert!(gate.observe(&aggregation(true)));
        let id = gate.pending().unwrap().invocation_id.clone();
        (gate, id)
    }

    // 1. Pass-through when no approval is needed
    #[test]
    fn no_approval_needed_is_pass_through() {
        let mut gate = ApprovalGate::default();
        assert!(!gate.observe(&aggregation(false)));
        assert_eq!(gate.state(), ApprovalState::None);
        assert!(gate.take_notification().is_none());
    }

    // 2. None -> Pending builds the request payload
    #[test]
    fn observe_moves_to_pending() {
        let (gate, _) = pending_gate();
        assert_eq!(gate.state(), ApprovalState::Pending);
        let pending = gate.pending().unwrap();
        assert_eq!(pending.payload.final_score, 95.0);
        assert_eq!(pending.payload.letter_grade, LetterGrade::A);
        assert!(pending.hint.contains("Final Score: 95/100 (95.0%) - Grade: A"));
    }

    // 3. Re-observing and re-rendering do not re-notify
    #[test]
    fn notification_is_surfaced_once() {
        let (mut gate, id) = pending_gate();
        assert!(!gate.observe(&aggregation(true)));
        assert_eq!(gate.pending().unwrap().invocation_id, id);

        assert!(gate.take_notification().is_some());
        assert!(gate.take_notification().is_none());
        assert!(!gate.observe(&aggregation(true)));
        assert!(gate.take_notification().is_none());
    }

    // 4. Each decision maps to its state
    #[test]
    fn decisions_map_to_states() {
        let cases = [
            (Decision::Approve, ApprovalState::Approved),
            (
                Decision::ManualAdjust {
                    score: 80.0,
                    letter_grade: "B".into(),
                    feedback_text: "ok".into(),
                },
                ApprovalState::ManualOverride,
            ),
            (
                Decision::Regrade { comment: None },
                ApprovalState::RegradeRequested,
            ),
            (Decision::Cancel, ApprovalState::Cancelled),
        ];
        for (decision, expected) in cases {
            let (mut gate, id) = pending_gate();
            assert_eq!(gate.decide(&id, &decision).unwrap(), expected);
            assert!(gate.pending().is_none());
        }
    }

    // 5. A decision outside Pending is an invalid transition
    #[test]
    fn decide_without_pending_is_rejected() {
        let mut gate = ApprovalGate::default();
        let err = gate.decide("x", &Decision::Approve).unwrap_err();
        assert!(matches!(err, GradingError::InvalidTransition { .. }));

        let (mut gate, id) = pending_gate();
        gate.decide(&id, &Decision::Approve).unwrap();
        let err = gate
            .decide(&id, &Decision::Regrade { comment: None })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot apply decision 'regrade' while approval is approved"
        );
    }

    // 6. Wrong invocation id is refused and the gate stays pending
    #[test]
    fn wrong_invocation_id_is_refused() {
        let (mut gate, _) = pending_gate();
        let err = gate.decide("stale", &Decision::Approve).unwrap_err();
        assert!(matches!(err, GradingError::InvocationNotFound(_)));
        assert!(gate.is_pending());
    }

    #[test]
    fn hint_lists_every_criterion() {
        let hint = approval_hint(&aggregation(true));
        assert!(hint.starts_with("GRADE APPROVAL REQUIRED"));
        assert!(hint.contains("- Quality: 48/50 (96.0%)"));
        assert!(hint.contains("- Docs: FAILED (0/50)"));
        assert!(hint.contains("Reason: Score 95.0% is exceptional"));
        assert!(hint.ends_with("Do you approve this grade?"));
    }
}
