//! Human approval vocabulary: gate states, decisions, and the pending request
//! a human-facing surface renders.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::grade::LetterGrade;

/// State of the approval gate for one grading attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    #[default]
    None,
    Pending,
    Approved,
    ManualOverride,
    RegradeRequested,
    Cancelled,
}

impl ApprovalState {
    /// Whether no further decision can be applied in this attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApprovalState::Approved | ApprovalState::ManualOverride | ApprovalState::Cancelled
        )
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalState::None => "none",
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::ManualOverride => "manual_override",
            ApprovalState::RegradeRequested => "regrade_requested",
            ApprovalState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A human decision injected at the approval checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approve,
    ManualAdjust {
        score: f64,
        letter_grade: String,
        feedback_text: String,
    },
    Regrade {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    Cancel,
}

impl Decision {
    pub fn name(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::ManualAdjust { .. } => "manual_adjust",
            Decision::Regrade { .. } => "regrade",
            Decision::Cancel => "cancel",
        }
    }
}

/// Values a reviewer is asked to confirm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalPayload {
    pub final_score: f64,
    pub percentage: f64,
    pub letter_grade: LetterGrade,
}

/// The pending-confirmation record exposed while the pipeline is suspended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    /// Opaque identifier a resume call must present.
    pub invocation_id: String,
    pub hint: String,
    pub payload: ApprovalPayload,
}

/// Where the finalized grade came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeSource {
    Automatic,
    Approved,
    ManualOverride,
}

/// The grade recorded when a session finalizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalGrade {
    pub score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub letter_grade: String,
    pub source: GradeSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_text: Option<String>,
}
