//! Stage ordering and the single precondition that guards it.
//!
//! Every stage after validation is protected: it runs only when the persisted
//! validation verdict is valid. The first time evaluation is about to run for
//! a rubric, the evaluator set is built from it and its key set is recorded
//! as the aggregator's expected keys.

use std::fmt;
use std::sync::Arc;

use rubric_types::GradingError;
use serde::{Deserialize, Serialize};

use crate::evaluator::{build_evaluators, Evaluator, EvaluatorSet};
use crate::session::SessionState;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Evaluate,
    Aggregate,
    Approve,
    Feedback,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Stage::Validate,
        Stage::Evaluate,
        Stage::Aggregate,
        Stage::Approve,
        Stage::Feedback,
    ];

    /// Protected stages require a valid rubric.
    pub fn is_protected(self) -> bool {
        !matches!(self, Stage::Validate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Evaluate => "evaluate",
            Stage::Aggregate => "aggregate",
            Stage::Approve => "approve",
            Stage::Feedback => "feedback",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured explanation returned instead of running a blocked stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockReport {
    pub stage: Stage,
    pub errors: Vec<String>,
    pub message: String,
}

impl BlockReport {
    fn new(stage: Stage, errors: Vec<String>) -> Self {
        let errors = if errors.is_empty() {
            vec!["Rubric was not validated".to_string()]
        } else {
            errors
        };
        let details: Vec<String> = errors.iter().map(|e| format!("  - {e}")).collect();
        let message = format!(
            "GRADING BLOCKED: stage '{stage}' cannot proceed because the rubric validation failed.\n\
             Validation errors:\n{}\n\
             No grading was performed. Submit a corrected rubric to continue.",
            details.join("\n")
        );
        Self {
            stage,
            errors,
            message,
        }
    }
}

impl From<BlockReport> for GradingError {
    fn from(report: BlockReport) -> Self {
        GradingError::Blocked {
            stage: report.stage.to_string(),
            errors: report.errors,
        }
    }
}

/// Allow `stage` only when validation succeeded.
pub fn check(stage: Stage, state: &SessionState) -> std::result::Result<(), BlockReport> {
    if !stage.is_protected() || state.is_validated() {
        return Ok(());
    }
    let errors = state
        .validation
        .as_ref()
        .map(|v| v.errors().to_vec())
        .unwrap_or_default();
    tracing::warn!(stage = %stage, errors = errors.len(), "Stage blocked: rubric not valid");
    Err(BlockReport::new(stage, errors))
}

/// Run the precondition for `stage` and, before evaluation, make sure the
/// evaluator set matches the validated rubric.
///
/// `current` is replaced wholesale when it is missing or was built for a
/// different rubric; an up-to-date set is left untouched.
pub fn before_stage(
    stage: Stage,
    state: &mut SessionState,
    current: &mut Option<EvaluatorSet>,
    backend: &Arc<dyn Evaluator>,
) -> std::result::Result<(), BlockReport> {
    check(stage, state)?;
    if stage != Stage::Evaluate {
        return Ok(());
    }
    let Some(rubric) = state.rubric.as_ref() else {
        return Err(BlockReport::new(stage, Vec::new()));
    };

    let stale = current.as_ref().map_or(true, |set| !set.is_for(rubric));
    if stale {
        let set = build_evaluators(rubric, Arc::clone(backend));
        tracing::info!(evaluators = set.len(), "Built evaluator set from rubric");
        *current = Some(set);
    }
    if let Some(set) = current.as_ref() {
        let keys = set.keys();
        if state.expected_keys.as_ref() != Some(&keys) {
            state.expected_keys = Some(keys);
        }
    }
    Ok(())
}
