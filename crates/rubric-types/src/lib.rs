//! Shared types, errors, rubric model, and grading results for the rubric grading engine.
//!
//! This crate provides the foundational types used across the other crates:
//! - `GradingError`: unified error taxonomy
//! - `Rubric` / `Criterion` / `GradeKey`: the validated rubric and its slug rule
//! - `CriterionResult` / `AggregationResult`: per-criterion and aggregated grades
//! - `ApprovalState` / `Decision`: the human approval vocabulary
//! - `FinalFeedback`: structured feedback for the submitter

pub mod approval;
pub mod feedback;
pub mod grade;
pub mod rubric;

pub use approval::{
    ApprovalPayload, ApprovalState, Decision, FinalGrade, GradeSource, PendingApproval,
};
pub use feedback::{single_line, FinalFeedback};
pub use grade::{
    clamp_score, round1, AggregationResult, CriterionGrade, CriterionResult, EvaluatorOutput,
    FailedCriterion, FailureKind, FailureRecord, GradeDetail, GradeStatus, LetterGrade,
};
pub use rubric::{slugify, Criterion, GradeKey, Rubric, SLUG_PLACEHOLDER};

/// Unified error type for all grading subsystems.
#[derive(Debug, thiserror::Error)]
pub enum GradingError {
    // === Input Errors ===
    #[error("Rubric validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    // === Evaluator Errors ===
    #[error("Evaluator for criterion '{criterion}' failed: {message}")]
    EvaluatorFailure { criterion: String, message: String },

    #[error("No result was produced for '{key}'")]
    MissingResult { key: String },

    #[error("Evaluation backend unavailable: {0}. Session was reset; please retry.")]
    BackendUnavailable(String),

    #[error("Output failed schema validation: {0}")]
    SchemaViolation(String),

    #[error("Empty or missing output for key '{key}'")]
    EmptyOutput { key: String },

    #[error("Evaluator call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // === Pipeline Errors ===
    #[error("Stage '{stage}' blocked: rubric is not valid")]
    Blocked { stage: String, errors: Vec<String> },

    #[error("Cannot apply decision '{decision}' while approval is {from}")]
    InvalidTransition { from: String, decision: String },

    #[error("No suspended invocation with id '{0}'")]
    InvocationNotFound(String),

    #[error("Another grading attempt is already active for this session")]
    SessionBusy,

    #[error("Result for '{key}' was already recorded in this attempt")]
    DuplicateResult { key: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl GradingError {
    /// Returns `true` if the retry wrapper converts this error into a failure record
    /// instead of propagating it. Only an unreachable backend may abort an attempt.
    pub fn is_absorbable(&self) -> bool {
        !matches!(self, GradingError::BackendUnavailable(_))
    }

    /// Returns `true` if the error is permanent for the submission attempt and the
    /// user must change their input before trying again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GradingError::Validation(_) | GradingError::Blocked { .. } | GradingError::Config(_)
        )
    }

    /// The failure kind recorded when the retry wrapper gives up on this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            GradingError::EmptyOutput { .. } => FailureKind::EmptyOutput,
            _ => FailureKind::Validation,
        }
    }
}

/// A convenience alias for `Result<T, GradingError>`.
pub type Result<T> = std::result::Result<T, GradingError>;
