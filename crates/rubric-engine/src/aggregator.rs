//! Score aggregation and the approval decision.
//!
//! A pure function of the session's rubric, expected key set and criterion
//! results: the same state always yields the same [`AggregationResult`].

use rubric_types::{
    clamp_score, round1, AggregationResult, CriterionResult, FailedCriterion, GradeDetail,
    GradeKey, GradeStatus, GradingError, LetterGrade, Result,
};

use crate::config::GradingConfig;
use crate::session::SessionState;
use crate::validation::format_points;

/// Reconcile every expected criterion into one aggregated grade.
///
/// The denominator always counts every expected criterion. Failed and
/// missing criteria score zero, are reported separately, and force approval.
pub fn aggregate(state: &SessionState, config: &GradingConfig) -> Result<AggregationResult> {
    let keys = expected_keys(state)?;

    let mut total_score = 0.0;
    let mut max_possible = 0.0;
    let mut grade_details = Vec::with_capacity(keys.len());
    let mut failed_criteria = Vec::new();
    let mut missing_grade_keys = Vec::new();

    for key in keys {
        let (criterion, max_score) = describe(state, &key);
        max_possible += max_score;

        let detail = match state.results.get(&key) {
            Some(CriterionResult::Grade(g)) => {
                let score = clamp_score(g.score, max_score);
                total_score += score;
                GradeDetail {
                    criterion,
                    key,
                    score,
                    max_score,
                    percentage: percent(score, max_score),
                    justification: g.notes.clone(),
                    status: GradeStatus::Graded,
                }
            }
            Some(CriterionResult::Failure { failure, .. }) => {
                failed_criteria.push(FailedCriterion {
                    key: key.clone(),
                    criterion: criterion.clone(),
                    max_score,
                    error_type: failure.error_type,
                    error_message: failure.error_message.clone(),
                });
                GradeDetail {
                    criterion,
                    key,
                    score: 0.0,
                    max_score,
                    percentage: 0.0,
                    justification: failure.error_message.clone(),
                    status: GradeStatus::Failed,
                }
            }
            None => {
                missing_grade_keys.push(key.clone());
                GradeDetail {
                    criterion,
                    key,
                    score: 0.0,
                    max_score,
                    percentage: 0.0,
                    justification: String::new(),
                    status: GradeStatus::Missing,
                }
            }
        };
        grade_details.push(detail);
    }

    let percentage = percent(total_score, max_possible);
    let letter_grade = LetterGrade::from_percentage(percentage);

    let mut reasons = Vec::new();
    if !failed_criteria.is_empty() {
        let names: Vec<&str> = failed_criteria.iter().map(|f| f.criterion.as_str()).collect();
        reasons.push(format!(
            "One or more criteria failed to grade: {}.",
            names.join(", ")
        ));
    }
    if !missing_grade_keys.is_empty() {
        let names: Vec<String> = missing_grade_keys.iter().map(GradeKey::to_string).collect();
        reasons.push(format!(
            "Some criteria are missing valid grades: {}.",
            names.join(", ")
        ));
    }
    if percentage < config.failing_threshold {
        reasons.push(format!(
            "Score {percentage:.1}% is below passing threshold ({}%). Please review before confirming.",
            format_points(config.failing_threshold)
        ));
    }
    if percentage > config.exceptional_threshold {
        reasons.push(format!(
            "Score {percentage:.1}% is exceptional (>{}%). Please verify the evaluation is accurate.",
            format_points(config.exceptional_threshold)
        ));
    }

    let requires_human_approval = !reasons.is_empty();
    let approval_reason = requires_human_approval.then(|| reasons.join(" "));

    let message = format!(
        "Final score: {}/{} ({percentage:.1}%) - Grade: {letter_grade}",
        format_points(total_score),
        format_points(max_possible),
    );

    tracing::info!(
        total_score,
        max_possible,
        percentage,
        letter = %letter_grade,
        requires_human_approval,
        failed = failed_criteria.len(),
        missing = missing_grade_keys.len(),
        "Aggregated criterion results"
    );

    Ok(AggregationResult {
        total_score,
        max_possible,
        percentage,
        letter_grade,
        grade_details,
        requires_human_approval,
        approval_reason,
        failed_criteria,
        missing_grade_keys,
        message,
    })
}

/// The guardrail's key set when it has run, otherwise the rubric's.
fn expected_keys(state: &SessionState) -> Result<Vec<GradeKey>> {
    if let Some(keys) = &state.expected_keys {
        return Ok(keys.clone());
    }
    match &state.rubric {
        Some(rubric) => Ok(rubric.grade_keys()),
        None => Err(GradingError::Blocked {
            stage: "aggregate".into(),
            errors: vec!["Rubric was not validated".into()],
        }),
    }
}

/// Display name and max score for `key`, preferring the rubric's values.
fn describe(state: &SessionState, key: &GradeKey) -> (String, f64) {
    if let Some(c) = state.rubric.as_ref().and_then(|r| r.criterion(key)) {
        return (c.name.clone(), c.max_score);
    }
    match state.results.get(key) {
        Some(CriterionResult::Grade(g)) => (g.criterion_name.clone(), g.max_score),
        Some(CriterionResult::Failure {
            criterion_name,
            max_score,
            ..
        }) => (criterion_name.clone(), *max_score),
        None => (key.to_string(), 0.0),
    }
}

fn percent(score: f64, max: f64) -> f64 {
    if max > 0.0 {
        round1(score / max * 100.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rubric_types::{CriterionGrade, Criterion, FailureKind, FailureRecord, Rubric};

    fn state_with(criteria: &[(&str, f64)]) -> SessionState {
        let rubric = Rubric::new(
            "r",
            criteria
                .iter()
                .map(|(n, m)| Criterion::new(*n, "d", *m))
                .collect(),
        );
        SessionState {
            expected_keys: Some(rubric.grade_keys()),
            rubric: Some(rubric),
            ..Default::default()
        }
    }

    fn put_grade(state: &mut SessionState, slug: &str, score: f64) {
        let c = state
            .rubric
            .as_ref()
            .unwrap()
            .criterion(&GradeKey::new(slug))
            .unwrap()
            .clone();
        state
            .record_result(
                c.grade_key(),
                CriterionResult::Grade(CriterionGrade {
                    criterion_name: c.name,
                    max_score: c.max_score,
                    score,
                    notes: "n".into(),
                }),
            )
            .unwrap();
    }

    fn put_failure(state: &mut SessionState, slug: &str) {
        let c = state
            .rubric
            .as_ref()
            .unwrap()
            .criterion(&GradeKey::new(slug))
            .unwrap()
            .clone();
        state
            .record_result(
                c.grade_key(),
                CriterionResult::Failure {
                    criterion_name: c.name,
                    max_score: c.max_score,
                    failure: FailureRecord {
                        error_type: FailureKind::EmptyOutput,
                        error_message: "nothing produced".into(),
                        recoverable: true,
                        attempts: 3,
                        suggestion: None,
                    },
                },
            )
            .unwrap();
    }

    #[test]
    fn sums_scores_in_band_without_approval() {
        let mut state = state_with(&[("Quality", 50.0), ("Docs", 50.0)]);
        put_grade(&mut state, "quality", 45.0);
        put_grade(&mut state, "docs", 20.0);

        let r = aggregate(&state, &GradingConfig::default()).unwrap();
        assert_eq!(r.total_score, 65.0);
        assert_eq!(r.max_possible, 100.0);
        assert_eq!(r.percentage, 65.0);
        assert_eq!(r.letter_grade, LetterGrade::D);
        assert!(!r.requires_human_approval);
        assert!(r.approval_reason.is_none());
        assert_eq!(r.message, "Final score: 65/100 (65.0%) - Grade: D");
    }

    #[test]
    fn clamps_out_of_range_scores() {
        let mut state = state_with(&[("Low", 10.0), ("High", 15.0)]);
        put_grade(&mut state, "low", -5.0);
        put_grade(&mut state, "high", 20.0);

        let r = aggregate(&state, &GradingConfig::default()).unwrap();
        assert_eq!(r.grade_details[0].score, 0.0);
        assert_eq!(r.grade_details[1].score, 15.0);
        assert_eq!(r.total_score, 15.0);
    }

    #[test]
    fn failure_keeps_denominator_and_forces_approval() {
        let mut state = state_with(&[("Quality", 50.0), ("Docs", 50.0)]);
        put_grade(&mut state, "quality", 45.0);
        put_failure(&mut state, "docs");

        let r = aggregate(&state, &GradingConfig::default()).unwrap();
        assert_eq!(r.total_score, 45.0);
        assert_eq!(r.max_possible, 100.0);
        assert_eq!(r.percentage, 45.0);
        assert!(r.requires_human_approval);
        assert_eq!(r.failed_criteria.len(), 1);
        assert_eq!(r.failed_criteria[0].criterion, "Docs");
        assert_eq!(r.grade_details[1].status, GradeStatus::Failed);

        let reason = r.approval_reason.unwrap();
        assert!(reason.contains("One or more criteria failed to grade: Docs."));
        assert!(reason.contains("below passing threshold (50%)"));
    }

    #[test]
    fn missing_result_is_reported_separately() {
        let mut state = state_with(&[("Quality", 50.0), ("Docs", 50.0)]);
        put_grade(&mut state, "quality", 50.0);

        let r = aggregate(&state, &GradingConfig::default()).unwrap();
        assert_eq!(r.missing_grade_keys, vec![GradeKey::new("docs")]);
        assert!(r.failed_criteria.is_empty());
        assert_eq!(r.max_possible, 100.0);
        assert!(r
            .approval_reason
            .unwrap()
            .contains("missing valid grades: grade_docs."));
    }

    #[test]
    fn exceptional_score_requires_approval() {
        let mut state = state_with(&[("Quality", 50.0), ("Docs", 50.0)]);
        put_grade(&mut state, "quality", 48.0);
        put_grade(&mut state, "docs", 47.0);

        let r = aggregate(&state, &GradingConfig::default()).unwrap();
        assert_eq!(r.percentage, 95.0);
        assert!(r.requires_human_approval);
        assert!(r.approval_reason.unwrap().contains("exceptional"));
    }

    #[test]
    fn thresholds_are_strict() {
        let config = GradingConfig::default();

        let mut at_fail = state_with(&[("Only", 100.0)]);
        put_grade(&mut at_fail, "only", 50.0);
        assert!(!aggregate(&at_fail, &config).unwrap().requires_human_approval);

        let mut at_top = state_with(&[("Only", 100.0)]);
        put_grade(&mut at_top, "only", 90.0);
        assert!(!aggregate(&at_top, &config).unwrap().requires_human_approval);

        let mut below = state_with(&[("Only", 100.0)]);
        put_grade(&mut below, "only", 49.9);
        assert!(aggregate(&below, &config).unwrap().requires_human_approval);
    }

    #[test]
    fn thresholds_come_from_config() {
        let config = GradingConfig {
            failing_threshold: 60.0,
            ..Default::default()
        };
        let mut state = state_with(&[("Only", 100.0)]);
        put_grade(&mut state, "only", 55.0);

        let r = aggregate(&state, &config).unwrap();
        assert!(r.requires_human_approval);
        assert!(r.approval_reason.unwrap().contains("(60%)"));
    }

    #[test]
    fn falls_back_to_rubric_keys() {
        let mut state = state_with(&[("Quality", 10.0)]);
        state.expected_keys = None;
        put_grade(&mut state, "quality", 7.0);

        let r = aggregate(&state, &GradingConfig::default()).unwrap();
        assert_eq!(r.total_score, 7.0);
    }

    #[test]
    fn without_rubric_or_keys_is_blocked() {
        let err = aggregate(&SessionState::default(), &GradingConfig::default()).unwrap_err();
        assert!(matches!(err, GradingError::Blocked { .. }));
    }

    #[test]
    fn repeated_aggregation_is_byte_identical() {
        let mut state = state_with(&[("Quality", 50.0), ("Docs", 50.0)]);
        put_grade(&mut state, "quality", 33.3);
        put_failure(&mut state, "docs");

        let config = GradingConfig::default();
        let a = serde_json::to_string(&aggregate(&state, &config).unwrap()).unwrap();
        let b = serde_json::to_string(&aggregate(&state, &config).unwrap()).unwrap();
        assert_eq!(a, b);
    }
}
