//! Structured feedback for the submitter.

use serde::{Deserialize, Serialize};

const MAX_ITEMS: usize = 3;
const MAX_ITEM_CHARS: usize = 200;
const MAX_ENCOURAGEMENT_CHARS: usize = 300;
const MAX_SUMMARY_CHARS: usize = 400;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalFeedback {
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default, alias = "improvements")]
    pub areas_for_improvement: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub encouragement: String,
    #[serde(default)]
    pub overall_summary: String,
}

impl FinalFeedback {
    /// Enforce the output bounds: at most three items per list, single-line
    /// strings, and per-field length caps. Blank items are dropped.
    pub fn normalized(self) -> Self {
        Self {
            strengths: cap_list(self.strengths),
            areas_for_improvement: cap_list(self.areas_for_improvement),
            suggestions: cap_list(self.suggestions),
            encouragement: single_line(&self.encouragement, MAX_ENCOURAGEMENT_CHARS),
            overall_summary: single_line(&self.overall_summary, MAX_SUMMARY_CHARS),
        }
    }

    /// `true` when every field is blank.
    pub fn is_blank(&self) -> bool {
        self.strengths.iter().all(|s| s.trim().is_empty())
            && self.areas_for_improvement.iter().all(|s| s.trim().is_empty())
            && self.suggestions.iter().all(|s| s.trim().is_empty())
            && self.encouragement.trim().is_empty()
            && self.overall_summary.trim().is_empty()
    }
}

fn cap_list(items: Vec<String>) -> Vec<String> {
    items
        .iter()
        .map(|s| single_line(s, MAX_ITEM_CHARS))
        .filter(|s| !s.is_empty())
        .take(MAX_ITEMS)
        .collect()
}

/// Fold whitespace runs (including newlines) to single spaces and truncate
/// to `max_chars` characters.
pub fn single_line(text: &str, max_chars: usize) -> String {
    let folded = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if folded.chars().count() <= max_chars {
        folded
    } else {
        folded.chars().take(max_chars).collect::<String>().trim_end().to_string()
    }
}
