//! Per-criterion results and the aggregated grade derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rubric::{Criterion, GradeKey};

/// Round to one decimal place.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Evaluator output / CriterionGrade
// ---------------------------------------------------------------------------

/// Raw output of an evaluator collaborator for one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorOutput {
    pub score: f64,
    #[serde(default, alias = "evaluation_notes", alias = "justification")]
    pub notes: String,
}

/// A successful grade for one criterion. The score is always within `[0, max_score]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionGrade {
    pub criterion_name: String,
    pub max_score: f64,
    pub score: f64,
    pub notes: String,
}

impl CriterionGrade {
    /// Bind an evaluator output to its criterion, clamping the score.
    pub fn from_output(criterion: &Criterion, output: EvaluatorOutput) -> Self {
        Self {
            criterion_name: criterion.name.clone(),
            max_score: criterion.max_score,
            score: clamp_score(output.score, criterion.max_score),
            notes: output.notes,
        }
    }
}

/// Clamp a score into `[0, max_score]`.
pub fn clamp_score(score: f64, max_score: f64) -> f64 {
    score.max(0.0).min(max_score.max(0.0))
}

// ---------------------------------------------------------------------------
// Failure records
// ---------------------------------------------------------------------------

/// Why a retried stage gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    EmptyOutput,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Validation => f.write_str("validation"),
            FailureKind::EmptyOutput => f.write_str("empty_output"),
        }
    }
}

/// Structured record written in place of a stage output once retries are exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub error_type: FailureKind,
    pub error_message: String,
    pub recoverable: bool,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Exactly one of these exists per criterion per grading attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CriterionResult {
    Grade(CriterionGrade),
    Failure {
        criterion_name: String,
        max_score: f64,
        failure: FailureRecord,
    },
}

impl CriterionResult {
    pub fn is_grade(&self) -> bool {
        matches!(self, CriterionResult::Grade(_))
    }

    pub fn criterion_name(&self) -> &str {
        match self {
            CriterionResult::Grade(g) => &g.criterion_name,
            CriterionResult::Failure { criterion_name, .. } => criterion_name,
        }
    }
}

// ---------------------------------------------------------------------------
// LetterGrade
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LetterGrade {
    A,
    B,
    C,
    D,
    F,
}

impl LetterGrade {
    /// Fixed banding: A≥90, B≥80, C≥70, D≥60, else F.
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= 90.0 {
            LetterGrade::A
        } else if percentage >= 80.0 {
            LetterGrade::B
        } else if percentage >= 70.0 {
            LetterGrade::C
        } else if percentage >= 60.0 {
            LetterGrade::D
        } else {
            LetterGrade::F
        }
    }
}

impl fmt::Display for LetterGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LetterGrade::A => "A",
            LetterGrade::B => "B",
            LetterGrade::C => "C",
            LetterGrade::D => "D",
            LetterGrade::F => "F",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// AggregationResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeStatus {
    Graded,
    Failed,
    Missing,
}

/// One line of the aggregated grade, in rubric order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeDetail {
    pub criterion: String,
    pub key: GradeKey,
    pub score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub justification: String,
    pub status: GradeStatus,
}

/// A criterion whose evaluator exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedCriterion {
    pub key: GradeKey,
    pub criterion: String,
    pub max_score: f64,
    pub error_type: FailureKind,
    pub error_message: String,
}

/// Deterministic summary of every criterion result in a grading attempt.
///
/// Never mutated in place: a regrade replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub total_score: f64,
    pub max_possible: f64,
    pub percentage: f64,
    pub letter_grade: LetterGrade,
    pub grade_details: Vec<GradeDetail>,
    pub requires_human_approval: bool,
    pub approval_reason: Option<String>,
    pub failed_criteria: Vec<FailedCriterion>,
    pub missing_grade_keys: Vec<GradeKey>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round1_rounds_to_one_decimal() {
        assert_eq!(round1(65.0), 65.0);
        assert_eq!(round1(66.66666), 66.7);
        assert_eq!(round1(33.33333), 33.3);
    }

    #[test]
    fn clamp_score_bounds_both_sides() {
        assert_eq!(clamp_score(-5.0, 10.0), 0.0);
        assert_eq!(clamp_score(20.0, 15.0), 15.0);
        assert_eq!(clamp_score(7.5, 10.0), 7.5);
    }

    #[test]
    fn from_output_clamps_and_binds_criterion() {
        let criterion = Criterion::new("Quality", "q", 15.0);
        let grade = CriterionGrade::from_output(
            &criterion,
            EvaluatorOutput {
                score: 20.0,
                notes: "great".into(),
            },
        );
        assert_eq!(grade.score, 15.0);
        assert_eq!(grade.max_score, 15.0);
        assert_eq!(grade.criterion_name, "Quality");
    }

    #[test]
    fn evaluator_output_accepts_evaluation_notes_alias() {
        let out: EvaluatorOutput =
            serde_json::from_str(r#"{"score": 4, "evaluation_notes": "ok"}"#).unwrap();
        assert_eq!(out.score, 4.0);
        assert_eq!(out.notes, "ok");
    }

    #[test]
    fn letter_grade_banding() {
        assert_eq!(LetterGrade::from_percentage(95.0), LetterGrade::A);
        assert_eq!(LetterGrade::from_percentage(90.0), LetterGrade::A);
        assert_eq!(LetterGrade::from_percentage(89.9), LetterGrade::B);
        assert_eq!(LetterGrade::from_percentage(70.0), LetterGrade::C);
        assert_eq!(LetterGrade::from_percentage(65.0), LetterGrade::D);
        assert_eq!(LetterGrade::from_percentage(59.9), LetterGrade::F);
    }

    #[test]
    fn criterion_result_is_tagged() {
        let failure = CriterionResult::Failure {
            criterion_name: "Docs".into(),
            max_score: 50.0,
            failure: FailureRecord {
                error_type: FailureKind::EmptyOutput,
                error_message: "nothing".into(),
                recoverable: true,
                attempts: 3,
                suggestion: None,
            },
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "failure");
        assert_eq!(json["failure"]["error_type"], "empty_output");
        assert!(!failure.is_grade());
        assert_eq!(failure.criterion_name(), "Docs");
    }
}
