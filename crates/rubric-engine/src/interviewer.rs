//! Human decision channel for the approval gate.

use async_trait::async_trait;
use rubric_types::{Decision, GradingError, PendingApproval, Result};

#[async_trait]
pub trait ApprovalInterviewer: Send + Sync {
    async fn decide(&self, pending: &PendingApproval) -> Result<Decision>;
}

// ---------------------------------------------------------------------------
// AutoApproveInterviewer
// ---------------------------------------------------------------------------

/// Approves every request unseen.
pub struct AutoApproveInterviewer;

#[async_trait]
impl ApprovalInterviewer for AutoApproveInterviewer {
    async fn decide(&self, pending: &PendingApproval) -> Result<Decision> {
        tracing::info!(invocation_id = %pending.invocation_id, "Auto-approving grade");
        Ok(Decision::Approve)
    }
}

// ---------------------------------------------------------------------------
// ConsoleInterviewer
// ---------------------------------------------------------------------------

/// Prompts on stdout and reads the decision from stdin.
///
/// Accepted answers: `approve`, `adjust <score> <letter> <feedback...>`,
/// `regrade [comment...]`, `cancel` (or their first letters).
pub struct ConsoleInterviewer;

#[async_trait]
impl ApprovalInterviewer for ConsoleInterviewer {
    async fn decide(&self, pending: &PendingApproval) -> Result<Decision> {
        println!("\n{}", pending.hint);
        loop {
            println!("  [a]pprove | [m]anual adjust <score> <letter> <feedback> | [r]egrade [comment] | [c]ancel");
            let line = tokio::task::spawn_blocking(|| {
                let mut input = String::new();
                std::io::stdin().read_line(&mut input).map(|_| input)
            })
            .await
            .map_err(|e| GradingError::Other(format!("stdin reader failed: {e}")))??;

            if line.is_empty() {
                return Ok(Decision::Cancel);
            }
            match parse_decision(&line) {
                Some(decision) => return Ok(decision),
                None => println!("Unrecognized answer: {}", line.trim()),
            }
        }
    }
}

/// Parse a console answer into a decision.
pub fn parse_decision(input: &str) -> Option<Decision> {
    let input = input.trim();
    let (verb, rest) = match input.split_once(char::is_whitespace) {
        Some((v, r)) => (v, r.trim()),
        None => (input, ""),
    };
    match verb.to_ascii_lowercase().as_str() {
        "a" | "approve" | "y" | "yes" => Some(Decision::Approve),
        "c" | "cancel" => Some(Decision::Cancel),
        "r" | "regrade" => Some(Decision::Regrade {
            comment: (!rest.is_empty()).then(|| rest.to_string()),
        }),
        "m" | "adjust" | "manual" => {
            let mut parts = rest.splitn(3, char::is_whitespace);
            let score = parts.next()?.parse::<f64>().ok().filter(|s| s.is_finite())?;
            let letter_grade = parts.next()?.to_string();
            let feedback_text = parts.next().unwrap_or("").trim().to_string();
            Some(Decision::ManualAdjust {
                score,
                letter_grade,
                feedback_text,
            })
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// RecordingInterviewer
// ---------------------------------------------------------------------------

/// Replays scripted decisions and records every request it was shown.
///
/// Once the script runs out it approves.
pub struct RecordingInterviewer {
    decisions: std::sync::Mutex<Vec<Decision>>,
    requests: std::sync::Mutex<Vec<PendingApproval>>,
}

impl RecordingInterviewer {
    pub fn new(decisions: Vec<Decision>) -> Self {
        let mut reversed = decisions;
        reversed.reverse();
        Self {
            decisions: std::sync::Mutex::new(reversed),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<PendingApproval> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ApprovalInterviewer for RecordingInterviewer {
    async fn decide(&self, pending: &PendingApproval) -> Result<Decision> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(pending.clone());
        }
        let next = self.decisions.lock().ok().and_then(|mut d| d.pop());
        Ok(next.unwrap_or(Decision::Approve))
    }
}
