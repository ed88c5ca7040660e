//! CLI binary for validating rubrics and grading submissions against them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rubric_engine::{
    AutoApproveInterviewer, CommandComposer, CommandEvaluator, ConsoleInterviewer,
    EvaluationRequest, Evaluator, GradingConfig, GradingEngine, GradingEvent, GradingReport,
    GradingSession, PipelineOutcome,
};
use rubric_types::{CriterionResult, Decision, EvaluatorOutput, GradingError};

#[derive(Parser)]
#[command(name = "rubric", version, about = "Rubric grading with human approval checkpoints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a rubric JSON file
    Validate {
        /// Path to the rubric .json file
        rubric: PathBuf,
    },

    /// Show the criteria, result keys and point total of a rubric
    Info {
        /// Path to the rubric .json file
        rubric: PathBuf,
    },

    /// Grade a submission against a rubric
    Grade {
        /// Path to the rubric .json file
        rubric: PathBuf,

        /// Path to the submission file
        submission: PathBuf,

        /// Shell command that grades one criterion (request JSON on stdin, {score, notes} on stdout)
        #[arg(long)]
        evaluator_cmd: String,

        /// Shell command that writes feedback JSON (default: built-in summary)
        #[arg(long)]
        feedback_cmd: Option<String>,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Save a checkpoint here when the grade needs approval
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Ask for approval decisions on the console
        #[arg(long, conflicts_with = "auto_approve")]
        interactive: bool,

        /// Approve every grade that needs approval
        #[arg(long)]
        auto_approve: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Override the failing threshold (percent)
        #[arg(long)]
        failing_threshold: Option<f64>,

        /// Override the exceptional threshold (percent)
        #[arg(long)]
        exceptional_threshold: Option<f64>,

        /// Override the number of evaluators run at once
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Resume a grade suspended at the approval checkpoint
    Resume {
        /// Directory holding checkpoint.json
        checkpoint_dir: PathBuf,

        /// Invocation id printed when the grade was suspended
        invocation_id: String,

        #[command(subcommand)]
        decision: DecisionArg,

        /// Evaluator command, needed for a regrade
        #[arg(long, global = true)]
        evaluator_cmd: Option<String>,

        /// Shell command that writes feedback JSON (default: built-in summary)
        #[arg(long, global = true)]
        feedback_cmd: Option<String>,

        /// TOML configuration file
        #[arg(short, long, global = true)]
        config: Option<PathBuf>,

        /// Print the result as JSON
        #[arg(long, global = true)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum DecisionArg {
    /// Accept the computed grade
    Approve,
    /// Record a grade verbatim
    Adjust {
        score: f64,
        letter_grade: String,
        feedback: String,
    },
    /// Discard the grades and evaluate again
    Regrade {
        /// Note passed to every evaluator
        comment: Option<String>,
    },
    /// Stop without recording a grade
    Cancel,
}

impl From<DecisionArg> for Decision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Approve => Decision::Approve,
            DecisionArg::Adjust {
                score,
                letter_grade,
                feedback,
            } => Decision::ManualAdjust {
                score,
                letter_grade,
                feedback_text: feedback,
            },
            DecisionArg::Regrade { comment } => Decision::Regrade { comment },
            DecisionArg::Cancel => Decision::Cancel,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { rubric } => {
            cmd_validate(&rubric)?;
        }
        Commands::Info { rubric } => {
            cmd_info(&rubric)?;
        }
        Commands::Grade {
            rubric,
            submission,
            evaluator_cmd,
            feedback_cmd,
            config,
            checkpoint_dir,
            interactive,
            auto_approve,
            json,
            failing_threshold,
            exceptional_threshold,
            concurrency,
        } => {
            let mut config = GradingConfig::load(config.as_deref())?;
            if let Some(t) = failing_threshold {
                config.failing_threshold = t;
            }
            if let Some(t) = exceptional_threshold {
                config.exceptional_threshold = t;
            }
            if let Some(n) = concurrency {
                config.evaluator_concurrency = n;
            }
            config.validate()?;

            let mode = if interactive {
                ApprovalMode::Console
            } else if auto_approve {
                ApprovalMode::Auto
            } else {
                ApprovalMode::Suspend
            };
            let engine = build_engine(config, Some(evaluator_cmd), feedback_cmd, checkpoint_dir);
            cmd_grade(&engine, &rubric, &submission, mode, json).await?;
        }
        Commands::Resume {
            checkpoint_dir,
            invocation_id,
            decision,
            evaluator_cmd,
            feedback_cmd,
            config,
            json,
        } => {
            let config = GradingConfig::load(config.as_deref())?;
            let decision = Decision::from(decision);
            if matches!(decision, Decision::Regrade { .. }) && evaluator_cmd.is_none() {
                anyhow::bail!("A regrade needs --evaluator-cmd");
            }
            let engine =
                build_engine(config, evaluator_cmd, feedback_cmd, Some(checkpoint_dir.clone()));
            cmd_resume(&engine, &checkpoint_dir, &invocation_id, decision, json).await?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// validate / info
// ---------------------------------------------------------------------------

fn read_rubric(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read rubric {}: {}", path.display(), e))
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let raw = read_rubric(path)?;
    match rubric_engine::parse_rubric(&raw) {
        Ok(rubric) => {
            println!(
                "Rubric '{}' is valid with {} criteria totaling {} points",
                rubric.name,
                rubric.criteria.len(),
                rubric.total_points()
            );
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                println!("[ERROR] {}", error);
            }
            std::process::exit(1);
        }
    }
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let raw = read_rubric(path)?;
    let rubric = rubric_engine::parse_rubric(&raw).map_err(GradingError::Validation)?;

    println!("Rubric: {}", rubric.name);
    println!("Criteria: {}", rubric.criteria.len());
    println!("Total points: {}", rubric.total_points());

    println!("\nCriteria:");
    for criterion in &rubric.criteria {
        println!(
            "  {} [{}] max={}",
            criterion.name,
            criterion.grade_key(),
            criterion.max_score
        );
        if !criterion.description.is_empty() {
            println!("    {}", criterion.description);
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// grade / resume
// ---------------------------------------------------------------------------

enum ApprovalMode {
    Suspend,
    Auto,
    Console,
}

/// Stand-in for commands that never evaluate (approve, adjust, cancel).
struct NoEvaluator;

#[async_trait]
impl Evaluator for NoEvaluator {
    async fn evaluate(&self, _: &EvaluationRequest) -> rubric_types::Result<EvaluatorOutput> {
        Err(GradingError::BackendUnavailable(
            "no evaluator command configured".into(),
        ))
    }
}

fn build_engine(
    config: GradingConfig,
    evaluator_cmd: Option<String>,
    feedback_cmd: Option<String>,
    checkpoint_dir: Option<PathBuf>,
) -> GradingEngine {
    let timeout = config.evaluator_timeout();
    let evaluator: Arc<dyn Evaluator> = match evaluator_cmd {
        Some(cmd) => Arc::new(CommandEvaluator::new(cmd, timeout)),
        None => Arc::new(NoEvaluator),
    };
    let mut engine = GradingEngine::new(config, evaluator);
    if let Some(cmd) = feedback_cmd {
        engine = engine.with_composer(Arc::new(CommandComposer::new(cmd, timeout)));
    }
    if let Some(dir) = checkpoint_dir {
        engine = engine.with_checkpoint_dir(dir);
    }
    engine
}

async fn cmd_grade(
    engine: &GradingEngine,
    rubric_path: &Path,
    submission_path: &Path,
    mode: ApprovalMode,
    json: bool,
) -> anyhow::Result<()> {
    let raw = read_rubric(rubric_path)?;
    let submission = std::fs::read_to_string(submission_path).map_err(|e| {
        anyhow::anyhow!("Failed to read submission {}: {}", submission_path.display(), e)
    })?;

    if !json {
        spawn_progress(engine);
    }

    let session = GradingSession::new();
    let outcome = match mode {
        ApprovalMode::Suspend => engine.run(&session, &raw, &submission).await?,
        ApprovalMode::Auto => {
            engine
                .run_interactive(&session, &raw, &submission, &AutoApproveInterviewer)
                .await?
        }
        ApprovalMode::Console => {
            engine
                .run_interactive(&session, &raw, &submission, &ConsoleInterviewer)
                .await?
        }
    };
    print_outcome(&outcome, json)
}

async fn cmd_resume(
    engine: &GradingEngine,
    checkpoint_dir: &Path,
    invocation_id: &str,
    decision: Decision,
    json: bool,
) -> anyhow::Result<()> {
    if !json {
        spawn_progress(engine);
    }
    let (_session, outcome) = engine
        .resume_from_checkpoint(checkpoint_dir, invocation_id, decision)
        .await?;
    print_outcome(&outcome, json)
}

/// Print engine events to stderr as they arrive.
fn spawn_progress(engine: &GradingEngine) {
    let mut rx = engine.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                GradingEvent::CriterionGraded {
                    key,
                    score,
                    max_score,
                } => eprintln!("  graded {}: {}/{}", key, score, max_score),
                GradingEvent::CriterionFailed { key, error } => {
                    eprintln!("  FAILED {}: {}", key, error)
                }
                GradingEvent::RetryScheduled {
                    key,
                    attempt,
                    delay_ms,
                    ..
                } => eprintln!("  retrying {} (attempt {}) in {}ms", key, attempt + 1, delay_ms),
                GradingEvent::CheckpointSaved { path, .. } => {
                    eprintln!("Checkpoint saved to {}", path)
                }
                _ => {}
            }
        }
    });
}

fn print_outcome(outcome: &PipelineOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        let value = match outcome {
            PipelineOutcome::Completed(report) => {
                serde_json::json!({ "status": "completed", "report": report })
            }
            PipelineOutcome::Suspended(pending) => {
                serde_json::json!({ "status": "awaiting_approval", "pending": pending })
            }
            PipelineOutcome::Blocked(report) => {
                serde_json::json!({ "status": "blocked", "block": report })
            }
            PipelineOutcome::Cancelled => serde_json::json!({ "status": "cancelled" }),
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        match outcome {
            PipelineOutcome::Completed(report) => print_report(report),
            PipelineOutcome::Suspended(pending) => {
                println!("{}", pending.hint);
                println!("\nInvocation: {}", pending.invocation_id);
                println!(
                    "Resume with: rubric resume <checkpoint-dir> {} approve",
                    pending.invocation_id
                );
            }
            PipelineOutcome::Blocked(report) => {
                println!("{}", report.message);
                for error in &report.errors {
                    println!("[ERROR] {}", error);
                }
            }
            PipelineOutcome::Cancelled => println!("Grading cancelled"),
        }
    }

    if matches!(outcome, PipelineOutcome::Blocked(_)) {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &GradingReport) {
    if let Some(name) = &report.rubric_name {
        println!("Rubric: {}", name);
    }
    if let Some(agg) = &report.aggregation {
        println!("{}", agg.message);
        for detail in &agg.grade_details {
            println!(
                "  {}: {}/{} ({}%)",
                detail.criterion, detail.score, detail.max_score, detail.percentage
            );
        }
    }
    for (key, result) in &report.results {
        if let CriterionResult::Failure { failure, .. } = result {
            println!("  [{}] {}: {}", key, failure.error_type, failure.error_message);
        }
    }

    if let Some(grade) = &report.final_grade {
        println!(
            "\nFinal grade: {}/{} ({}%) {} [{}]",
            grade.score,
            grade.max_score,
            grade.percentage,
            grade.letter_grade,
            report.approval
        );
        if let Some(text) = &grade.feedback_text {
            println!("\n{}", text);
        }
    }

    if let Some(feedback) = &report.feedback {
        println!("\n{}", feedback.overall_summary);
        print_list("Strengths", &feedback.strengths);
        print_list("Areas for improvement", &feedback.areas_for_improvement);
        print_list("Suggestions", &feedback.suggestions);
        if !feedback.encouragement.is_empty() {
            println!("\n{}", feedback.encouragement);
        }
    } else if let Some(error) = &report.feedback_error {
        println!("\nFeedback unavailable: {}", error.error_message);
    }
}

fn print_list(title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("\n{}:", title);
    for item in items {
        println!("  - {}", item);
    }
}
