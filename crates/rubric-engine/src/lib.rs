//! Rubric grading engine: validation, parallel evaluation with retries,
//! aggregation, the approval gate, and feedback.
//!
//! A [`GradingEngine`] drives a fixed pipeline over a [`GradingSession`]:
//! the rubric is validated, one evaluator per criterion runs under a bounded
//! fan-out, results are aggregated, and anomalous grades suspend at an
//! approval checkpoint until a human [`Decision`](rubric_types::Decision)
//! resumes them.

pub mod aggregator;
pub mod approval;
pub mod checkpoint;
pub mod command;
pub mod config;
pub mod engine;
pub mod evaluator;
pub mod events;
pub mod feedback;
pub mod guardrail;
pub mod interviewer;
pub mod retry;
pub mod session;
pub mod validation;

pub use aggregator::aggregate;
pub use approval::{approval_hint, ApprovalGate};
pub use checkpoint::{clear_checkpoint, load_checkpoint, save_checkpoint, SessionCheckpoint};
pub use command::{CommandComposer, CommandEvaluator};
pub use config::{GradingConfig, RetryConfig};
pub use engine::{GradingEngine, GradingReport, GradingSession, PipelineOutcome};
pub use evaluator::{
    build_evaluators, run_evaluators, CriterionEvaluator, EvaluationRequest, Evaluator,
    EvaluatorSet,
};
pub use events::{EventEmitter, GradingEvent};
pub use feedback::{compose_feedback, FeedbackComposer, FeedbackRequest, SummaryComposer};
pub use guardrail::{BlockReport, Stage};
pub use interviewer::{
    parse_decision, ApprovalInterviewer, AutoApproveInterviewer, ConsoleInterviewer,
    RecordingInterviewer,
};
pub use retry::{run_with_retry, BackoffPolicy, RetryOutcome, RetryPolicy, StageOutput};
pub use session::{SessionPhase, SessionState};
pub use validation::{parse_rubric, validate_rubric, ValidationVerdict};
