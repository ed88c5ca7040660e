//! Shell-command backed collaborators.
//!
//! The request is written to the command's stdin as JSON and a JSON response
//! is read from its stdout. A command that cannot be spawned means the backend
//! is unavailable; a non-zero exit or unparseable output is a per-call failure
//! the retry wrapper absorbs.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rubric_types::{EvaluatorOutput, FinalFeedback, GradingError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;

use crate::evaluator::{EvaluationRequest, Evaluator};
use crate::feedback::{FeedbackComposer, FeedbackRequest};

const STDERR_EXCERPT_CHARS: usize = 500;
const KILL_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// CommandEvaluator
// ---------------------------------------------------------------------------

/// Scores a criterion by running `sh -c <command>`.
pub struct CommandEvaluator {
    command: String,
    timeout: Duration,
}

impl CommandEvaluator {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Evaluator for CommandEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluatorOutput> {
        run_json_command(&self.command, &request.criterion_name, request, self.timeout).await
    }
}

// ---------------------------------------------------------------------------
// CommandComposer
// ---------------------------------------------------------------------------

/// Composes feedback by running `sh -c <command>`.
pub struct CommandComposer {
    command: String,
    timeout: Duration,
}

impl CommandComposer {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl FeedbackComposer for CommandComposer {
    async fn compose(&self, request: &FeedbackRequest) -> Result<FinalFeedback> {
        run_json_command(&self.command, "feedback", request, self.timeout).await
    }
}

// ---------------------------------------------------------------------------
// Process plumbing
// ---------------------------------------------------------------------------

async fn run_json_command<Req, Resp>(
    command: &str,
    label: &str,
    request: &Req,
    timeout: Duration,
) -> Result<Resp>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let payload = serde_json::to_vec(request)?;

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    // Own process group so a timeout can take down pipelines and background jobs
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(|e| {
        GradingError::BackendUnavailable(format!("failed to spawn '{command}': {e}"))
    })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Input is fed while output drains, all under the one deadline.
    let exchange = async {
        let write = async move {
            if let Some(mut stdin) = stdin {
                // A command that ignores stdin may close it early.
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(label, error = %e, "Command did not read its input");
                }
            }
        };
        let (_, out, err, status) = tokio::join!(
            write,
            read_all(stdout),
            read_all(stderr),
            child.wait()
        );
        status.map(|status| (status, out, err))
    };
    let result = tokio::time::timeout(timeout, exchange).await;

    let (status, stdout, stderr) = match result {
        Ok(exchanged) => exchanged?,
        Err(_) => {
            tracing::warn!(label, timeout_ms = timeout.as_millis() as u64, "Command timed out");
            terminate(&mut child).await;
            return Err(GradingError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
    };

    let stdout = String::from_utf8_lossy(&stdout);
    tracing::debug!(
        label,
        exit_code = status.code().unwrap_or(-1),
        stdout_len = stdout.len(),
        stderr_len = stderr.len(),
        "Command completed"
    );

    if !status.success() {
        let stderr = String::from_utf8_lossy(&stderr);
        let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT_CHARS).collect();
        return Err(GradingError::EvaluatorFailure {
            criterion: label.to_string(),
            message: format!(
                "command exited with code {}: {excerpt}",
                status.code().unwrap_or(-1)
            ),
        });
    }

    serde_json::from_str(extract_json(&stdout))
        .map_err(|e| GradingError::SchemaViolation(format!("{label}: {e}")))
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

/// SIGTERM the command's process group, then SIGKILL whatever is left after
/// a grace period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let group = -(pid as i32);
            // SAFETY: signals only the process group created for this command.
            unsafe {
                libc::kill(group, libc::SIGTERM);
            }
            let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
            // SAFETY: as above; background jobs may outlive the shell.
            unsafe {
                libc::kill(group, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill().await;
}

/// Strip surrounding whitespace and a Markdown code fence, if any.
fn extract_json(stdout: &str) -> &str {
    let text = stdout.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EvaluationRequest {
        EvaluationRequest {
            criterion_name: "Quality".into(),
            description: "q".into(),
            max_score: 10.0,
            submission: "print('hi')".into(),
            regrade_comment: None,
        }
    }

    #[test]
    fn extract_json_strips_fences() {
        assert_eq!(extract_json("  {\"a\":1}\n"), "{\"a\":1}");
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("```\n{}\n```"), "{}");
    }

    #[tokio::test]
    async fn evaluator_parses_stdout() {
        let eval = CommandEvaluator::new(
            r#"cat > /dev/null; echo '{"score": 7, "notes": "tidy"}'"#,
            Duration::from_secs(5),
        );
        let out = eval.evaluate(&request()).await.unwrap();
        assert_eq!(out.score, 7.0);
        assert_eq!(out.notes, "tidy");
    }

    #[tokio::test]
    async fn evaluator_receives_request_on_stdin() {
        let eval = CommandEvaluator::new(
            r#"grep -q '"criterion_name":"Quality"' && echo '{"score": 1, "notes": "seen"}'"#,
            Duration::from_secs(5),
        );
        let out = eval.evaluate(&request()).await.unwrap();
        assert_eq!(out.notes, "seen");
    }

    #[tokio::test]
    async fn non_zero_exit_is_evaluator_failure() {
        let eval = CommandEvaluator::new("echo boom >&2; exit 3", Duration::from_secs(5));
        let err = eval.evaluate(&request()).await.unwrap_err();
        match err {
            GradingError::EvaluatorFailure { criterion, message } => {
                assert_eq!(criterion, "Quality");
                assert!(message.contains("code 3"));
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn garbage_stdout_is_schema_violation() {
        let eval = CommandEvaluator::new("echo not-json", Duration::from_secs(5));
        let err = eval.evaluate(&request()).await.unwrap_err();
        assert!(matches!(err, GradingError::SchemaViolation(_)));
        assert!(err.is_absorbable());
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let eval = CommandEvaluator::new("sleep 5", Duration::from_millis(50));
        let err = eval.evaluate(&request()).await.unwrap_err();
        assert!(matches!(err, GradingError::Timeout { timeout_ms: 50 }));
    }

    fn large_request() -> EvaluationRequest {
        EvaluationRequest {
            submission: "x".repeat(1_200_000),
            ..request()
        }
    }

    #[tokio::test]
    async fn timeout_covers_input_the_command_never_reads() {
        let eval = CommandEvaluator::new(
            r#"sleep 4; echo '{"score": 1, "notes": "late"}'"#,
            Duration::from_millis(200),
        );
        let started = std::time::Instant::now();
        let err = eval.evaluate(&large_request()).await.unwrap_err();
        assert!(matches!(err, GradingError::Timeout { timeout_ms: 200 }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn large_input_is_streamed_while_output_drains() {
        // `cat` writes the input back out, so stdout must be read during the write.
        let eval = CommandEvaluator::new(
            r#"cat; echo '{"score": 2, "notes": "read all"}' >&2"#,
            Duration::from_secs(10),
        );
        let err = eval.evaluate(&large_request()).await.unwrap_err();
        // The echoed request is not an evaluator output.
        assert!(matches!(err, GradingError::SchemaViolation(_)));

        let eval = CommandEvaluator::new(
            r#"wc -c > /dev/null; echo '{"score": 2, "notes": "read all"}'"#,
            Duration::from_secs(10),
        );
        let out = eval.evaluate(&large_request()).await.unwrap();
        assert_eq!(out.notes, "read all");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_background_jobs() {
        fn alive(pid: &str) -> bool {
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Ok(stat) => !stat.contains(") Z "),
                Err(_) => false,
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("job.pid");
        let eval = CommandEvaluator::new(
            format!("sleep 30 & echo $! > {}; wait", pid_file.display()),
            Duration::from_millis(300),
        );
        let err = eval.evaluate(&request()).await.unwrap_err();
        assert!(matches!(err, GradingError::Timeout { .. }));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let pid = pid.trim();
        assert!(!pid.is_empty());
        for _ in 0..50 {
            if !alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("background job {pid} survived the timeout");
    }

    #[tokio::test]
    async fn composer_parses_feedback() {
        let composer = CommandComposer::new(
            r#"echo '{"strengths": ["clear"], "overall_summary": "fine"}'"#,
            Duration::from_secs(5),
        );
        let req = FeedbackRequest {
            rubric_name: "r".into(),
            submission: "s".into(),
            aggregation: rubric_types::AggregationResult {
                total_score: 1.0,
                max_possible: 1.0,
                percentage: 100.0,
                letter_grade: rubric_types::LetterGrade::A,
                grade_details: vec![],
                requires_human_approval: false,
                approval_reason: None,
                failed_criteria: vec![],
                missing_grade_keys: vec![],
                message: String::new(),
            },
        };
        let fb = composer.compose(&req).await.unwrap();
        assert_eq!(fb.strengths, vec!["clear"]);
        assert_eq!(fb.overall_summary, "fine");
    }
}
