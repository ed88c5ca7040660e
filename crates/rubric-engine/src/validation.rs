//! Rubric schema validation.
//!
//! Fails closed: every structural problem is collected and reported, and the
//! verdict written to session state is the only thing the guardrail consults.

use rubric_types::{Criterion, Rubric};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::session::SessionState;

/// Outcome of validating a rubric document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationVerdict {
    Valid {
        criteria_count: usize,
        total_points: f64,
        message: String,
    },
    Invalid {
        errors: Vec<String>,
    },
}

impl ValidationVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationVerdict::Valid { .. })
    }

    /// The validation errors, empty for a valid verdict.
    pub fn errors(&self) -> &[String] {
        match self {
            ValidationVerdict::Valid { .. } => &[],
            ValidationVerdict::Invalid { errors } => errors,
        }
    }
}

/// Validate `raw` and persist the verdict (and, on success, the slug-annotated
/// rubric) into `state`.
///
/// A different rubric replaces the previous one and clears the expected key
/// set so the guardrail rebuilds evaluators for it.
pub fn validate_rubric(state: &mut SessionState, raw: &str) -> ValidationVerdict {
    let verdict = match parse_rubric(raw) {
        Ok(rubric) => {
            let total_points = rubric.total_points();
            let verdict = ValidationVerdict::Valid {
                criteria_count: rubric.criteria.len(),
                total_points,
                message: format!(
                    "Rubric '{}' is valid with {} criteria totaling {} points",
                    rubric.name,
                    rubric.criteria.len(),
                    format_points(total_points)
                ),
            };
            if state.rubric.as_ref() != Some(&rubric) {
                state.expected_keys = None;
                state.rubric = Some(rubric);
            }
            tracing::info!(
                criteria = state.rubric.as_ref().map_or(0, |r| r.criteria.len()),
                total_points,
                "Rubric validated"
            );
            verdict
        }
        Err(errors) => {
            tracing::warn!(error_count = errors.len(), "Rubric rejected");
            state.rubric = None;
            state.expected_keys = None;
            ValidationVerdict::Invalid { errors }
        }
    };
    state.validation = Some(verdict.clone());
    verdict
}

/// Parse and structurally check a rubric document, collecting every error.
pub fn parse_rubric(raw: &str) -> std::result::Result<Rubric, Vec<String>> {
    let doc: Value =
        serde_json::from_str(raw).map_err(|e| vec![format!("Invalid JSON format: {e}")])?;
    let Some(obj) = doc.as_object() else {
        return Err(vec!["Rubric must be a JSON object".to_string()]);
    };

    let mut errors = Vec::new();

    let name = match obj.get("name") {
        None => {
            errors.push("Missing 'name' field in rubric".to_string());
            String::new()
        }
        Some(Value::String(s)) => s.clone(),
        Some(_) => {
            errors.push("'name' must be a string".to_string());
            String::new()
        }
    };

    let criteria = match obj.get("criteria") {
        None => {
            errors.push("Missing 'criteria' field in rubric".to_string());
            return Err(errors);
        }
        Some(Value::Array(items)) => items,
        Some(_) => {
            errors.push("'criteria' must be a list".to_string());
            return Err(errors);
        }
    };
    if criteria.is_empty() {
        errors.push("Rubric must have at least one criterion".to_string());
        return Err(errors);
    }

    let mut parsed = Vec::with_capacity(criteria.len());
    for (i, item) in criteria.iter().enumerate() {
        let prefix = format!("Criterion {}", i + 1);
        match item.as_object() {
            Some(fields) => {
                if let Some(c) = parse_criterion(&prefix, fields, &mut errors) {
                    parsed.push(c);
                }
            }
            None => errors.push(format!("{prefix}: must be an object")),
        }
    }

    if errors.is_empty() {
        Ok(Rubric::new(name, parsed))
    } else {
        Err(errors)
    }
}

fn parse_criterion(
    prefix: &str,
    fields: &Map<String, Value>,
    errors: &mut Vec<String>,
) -> Option<Criterion> {
    let before = errors.len();

    let name = required_string(prefix, fields, "name", errors);

    let max_score = match fields.get("max_score") {
        None => {
            errors.push(format!("{prefix}: missing 'max_score' field"));
            None
        }
        Some(v) => match v.as_f64() {
            None => {
                errors.push(format!("{prefix}: 'max_score' must be a number"));
                None
            }
            Some(n) if n <= 0.0 => {
                errors.push(format!("{prefix}: 'max_score' must be positive"));
                None
            }
            Some(n) => Some(n),
        },
    };

    let description = required_string(prefix, fields, "description", errors);

    if errors.len() > before {
        return None;
    }
    Some(Criterion::new(name?, description?, max_score?))
}

fn required_string(
    prefix: &str,
    fields: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<String>,
) -> Option<String> {
    match fields.get(field) {
        None => {
            errors.push(format!("{prefix}: missing '{field}' field"));
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.push(format!("{prefix}: '{field}' must be a string"));
            None
        }
    }
}

/// Whole numbers print without a fractional part.
pub(crate) fn format_points(points: f64) -> String {
    if points.fract() == 0.0 && points.abs() < 1e15 {
        format!("{}", points as i64)
    } else {
        format!("{points}")
    }
}
