//! Persistence for sessions suspended at the approval gate.
//!
//! A suspended session is written to `<dir>/checkpoint.json`. Resuming loads
//! it, checks the invocation id, and injects the human decision as the next
//! input.

use std::path::{Path, PathBuf};

use rubric_types::Result;
use serde::{Deserialize, Serialize};

use crate::guardrail::Stage;
use crate::session::SessionState;

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Snapshot of a suspended grading session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    /// Identifier of the pending approval request this snapshot resumes.
    pub invocation_id: String,
    pub session_id: Option<String>,
    /// The stage the pipeline is suspended in.
    pub stage: Stage,
    pub state: SessionState,
    /// RFC 3339 timestamp of when the checkpoint was created.
    pub timestamp: String,
}

impl SessionCheckpoint {
    pub fn new(invocation_id: String, stage: Stage, state: SessionState) -> Self {
        Self {
            invocation_id,
            session_id: state.session_id.clone(),
            stage,
            state,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Save a checkpoint, creating `dir` if needed.
pub async fn save_checkpoint(checkpoint: &SessionCheckpoint, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(CHECKPOINT_FILE);
    let json = serde_json::to_string_pretty(checkpoint)?;
    tokio::fs::write(&path, json).await?;
    tracing::debug!(path = %path.display(), invocation_id = %checkpoint.invocation_id, "Checkpoint saved");
    Ok(path)
}

/// Load the checkpoint in `dir`, or `None` if there is none.
pub async fn load_checkpoint(dir: &Path) -> Result<Option<SessionCheckpoint>> {
    let path = dir.join(CHECKPOINT_FILE);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    let checkpoint: SessionCheckpoint = serde_json::from_str(&json)?;
    tracing::debug!(path = %path.display(), "Checkpoint loaded");
    Ok(Some(checkpoint))
}

/// Delete the checkpoint once the session has left the approval gate.
pub async fn clear_checkpoint(dir: &Path) -> Result<()> {
    let path = dir.join(CHECKPOINT_FILE);
    if tokio::fs::try_exists(&path).await? {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionPhase;

    fn sample() -> SessionCheckpoint {
        let mut state = SessionState::default();
        state.begin_attempt();
        state.submission = Some("print('hi')".into());
        state.phase = SessionPhase::AwaitingApproval;
        SessionCheckpoint::new("inv-1".into(), Stage::Approve, state)
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cp = sample();

        let path = save_checkpoint(&cp, dir.path()).await.unwrap();
        assert!(path.exists());

        let loaded = load_checkpoint(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded, cp);
        assert_eq!(loaded.session_id, cp.state.session_id);
    }

    #[tokio::test]
    async fn load_from_missing_directory_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_checkpoint(&dir.path().join("nope")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn clear_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(&sample(), dir.path()).await.unwrap();
        clear_checkpoint(dir.path()).await.unwrap();
        assert!(!dir.path().join(CHECKPOINT_FILE).exists());
        // Clearing twice is fine.
        clear_checkpoint(dir.path()).await.unwrap();
    }
}
