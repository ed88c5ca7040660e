//! Grading event system for observability.
//!
//! Emits [`GradingEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (CLI progress output, tests) can follow a grading run without
//! coupling to engine internals.

use rubric_types::{GradeSource, LetterGrade};
use serde::{Deserialize, Serialize};

use crate::guardrail::Stage;

/// Events emitted during a grading run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GradingEvent {
    StageStarted {
        stage: Stage,
    },
    StageCompleted {
        stage: Stage,
        duration_ms: u64,
    },
    StageBlocked {
        stage: Stage,
        errors: Vec<String>,
    },
    CriterionGraded {
        key: String,
        score: f64,
        max_score: f64,
    },
    CriterionFailed {
        key: String,
        error: String,
    },
    RetryScheduled {
        key: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    AggregationProduced {
        total_score: f64,
        max_possible: f64,
        percentage: f64,
        letter_grade: LetterGrade,
        requires_human_approval: bool,
    },
    ApprovalRequested {
        invocation_id: String,
        reason: Option<String>,
    },
    ApprovalResolved {
        invocation_id: String,
        decision: String,
    },
    GradingCompleted {
        session_id: String,
        percentage: f64,
    },
    GradingFinalized {
        session_id: String,
        source: GradeSource,
    },
    GradingCancelled,
    SessionReset {
        reason: String,
    },
    CheckpointSaved {
        invocation_id: String,
        path: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<GradingEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: GradingEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<GradingEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
