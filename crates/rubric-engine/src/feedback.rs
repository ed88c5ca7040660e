//! Feedback composition for a finalized grade.
//!
//! The composer is an external collaborator run under the same retry wrapper
//! as the evaluators. [`SummaryComposer`] is a local, deterministic composer
//! built from the grade details.

use async_trait::async_trait;
use rubric_types::{
    AggregationResult, FinalFeedback, GradeDetail, GradeStatus, LetterGrade, Result,
};
use serde::{Deserialize, Serialize};

use crate::events::EventEmitter;
use crate::retry::{run_with_retry, RetryOutcome, RetryPolicy};

/// Output key the feedback stage writes to.
pub const FEEDBACK_KEY: &str = "final_feedback";

/// Context handed to a feedback composer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub rubric_name: String,
    pub submission: String,
    pub aggregation: AggregationResult,
}

#[async_trait]
pub trait FeedbackComposer: Send + Sync {
    async fn compose(&self, request: &FeedbackRequest) -> Result<FinalFeedback>;
}

/// Compose feedback under `policy`, normalizing every attempt's output.
pub async fn compose_feedback(
    composer: &dyn FeedbackComposer,
    request: &FeedbackRequest,
    policy: &RetryPolicy,
    events: &EventEmitter,
) -> Result<RetryOutcome<FinalFeedback>> {
    run_with_retry(FEEDBACK_KEY, policy, events, |attempt| async move {
        tracing::debug!(attempt, "Composing feedback");
        composer.compose(request).await.map(FinalFeedback::normalized)
    })
    .await
}

// ---------------------------------------------------------------------------
// SummaryComposer
// ---------------------------------------------------------------------------

/// Builds feedback from the per-criterion results without any backend.
pub struct SummaryComposer;

#[async_trait]
impl FeedbackComposer for SummaryComposer {
    async fn compose(&self, request: &FeedbackRequest) -> Result<FinalFeedback> {
        let agg = &request.aggregation;

        let mut strong: Vec<&GradeDetail> = agg
            .grade_details
            .iter()
            .filter(|d| d.status == GradeStatus::Graded && d.percentage >= 80.0)
            .collect();
        strong.sort_by(|a, b| b.percentage.total_cmp(&a.percentage));

        let mut weak: Vec<&GradeDetail> = agg
            .grade_details
            .iter()
            .filter(|d| d.status != GradeStatus::Graded || d.percentage < 70.0)
            .collect();
        weak.sort_by(|a, b| a.percentage.total_cmp(&b.percentage));

        let strengths = strong
            .iter()
            .map(|d| describe(d, "Strong work on"))
            .collect();
        let areas_for_improvement = weak
            .iter()
            .map(|d| match d.status {
                GradeStatus::Graded => describe(d, "Room to improve in"),
                GradeStatus::Failed | GradeStatus::Missing => {
                    format!("{} could not be graded automatically", d.criterion)
                }
            })
            .collect();
        let suggestions = weak
            .iter()
            .map(|d| format!("Revisit {}: {}", d.criterion, first_sentence(&d.justification)))
            .collect();

        let encouragement = match agg.letter_grade {
            LetterGrade::A => "Excellent work. Keep pushing at this level.",
            LetterGrade::B => "Solid submission. A little polish will take it further.",
            LetterGrade::C => "A fair effort with clear next steps.",
            LetterGrade::D | LetterGrade::F => {
                "Every revision is progress. Focus on the areas above and try again."
            }
        }
        .to_string();

        Ok(FinalFeedback {
            strengths,
            areas_for_improvement,
            suggestions,
            encouragement,
            overall_summary: format!("{} for rubric '{}'.", agg.message, request.rubric_name),
        })
    }
}

fn describe(detail: &GradeDetail, lead: &str) -> String {
    let note = first_sentence(&detail.justification);
    if note.is_empty() {
        format!("{lead} {} ({:.1}%)", detail.criterion, detail.percentage)
    } else {
        format!("{lead} {} ({:.1}%): {note}", detail.criterion, detail.percentage)
    }
}

fn first_sentence(text: &str) -> &str {
    let text = text.trim();
    match text.find(". ") {
        Some(i) => &text[..=i],
        None => text,
    }
}
