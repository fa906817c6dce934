//! Run lifecycle: start or resume a run, work through its attempt queue,
//! capture a crash into the run row, and close the run with the scorer.

use crate::bench::{run_attempt, AttemptEnv, HarnessError};
use crate::config::{Provider, RunConfig};
use crate::llm::ProviderError;
use crate::printer::Printer;
use crate::scorer::{Attempt, HttpScorer, RunCompletion, Scorer, ScorerError, StartRunRequest};
use crate::store::{FailureInfo, NewRun, PassAtK, RunResult, RunStore};
use crate::util::{is_valid_uuid, progress_line};
use anyhow::{Context, Result};
use clap::ValueEnum;
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResumeMode {
    /// Record the failed attempt as an error and carry on.
    Skip,
    /// Reset the failed attempt on the server and run it again.
    Retry,
}

/// Advisory lock held for the lifetime of a run so two runs against the
/// same provider never share its rate limit. Released on drop.
#[derive(Debug)]
pub struct ProviderLock {
    _file: File,
}

impl ProviderLock {
    pub fn path(provider: Provider) -> PathBuf {
        std::env::temp_dir().join(format!("sherlockbench_client_{}.lock", provider))
    }

    /// Take the lock for `provider`, waiting for any run already holding it.
    pub async fn acquire(provider: Provider) -> Result<Self> {
        let path = Self::path(provider);
        tokio::task::spawn_blocking(move || Self::acquire_at(&path))
            .await
            .context("Lock task panicked")?
    }

    pub fn acquire_at(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                println!("A run for this provider is already in-progress. Awaiting its completion.");
                FileExt::lock_exclusive(&file)
                    .with_context(|| format!("Failed to lock {}", path.display()))?;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to lock {}", path.display()))
            }
        }
        tracing::debug!(path = %path.display(), "provider lock acquired");
        Ok(Self { _file: file })
    }
}

/// A run ready to process.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub run_id: String,
    pub config: RunConfig,
    pub benchmark_version: String,
    /// Every attempt the run was started with.
    pub all_attempts: Vec<Attempt>,
    /// The attempts still to run, in order.
    pub queue: Vec<Attempt>,
}

/// Ask the scorer for a new run and record it.
///
/// `target` is a problem-set id, or the id of a run the server has already
/// created.
pub async fn start_new_run(
    scorer: &HttpScorer,
    store: &dyn RunStore,
    mut config: RunConfig,
    target: Option<&str>,
    attempts_per_problem: Option<u32>,
    labels: &[String],
) -> Result<PreparedRun> {
    let (problem_set, existing_run_id) = match target {
        Some(id) if is_valid_uuid(id) => (None, Some(id.to_string())),
        Some(set) => (Some(set.to_string()), None),
        None => (None, None),
    };
    let request = StartRunRequest {
        client_id: config.target.client_id(),
        subset: config.subset.clone(),
        attempts_per_problem,
        problem_set,
        existing_run_id,
    };
    let started = scorer.start_run(&request).await?;

    println!(
        "Starting {} benchmark with model {}",
        started.run_type, config.target.settings.model
    );
    println!("Run id: {}", started.run_id);
    if !labels.is_empty() {
        println!("Labels: {}", labels.join(", "));
    }

    config.run_type = Some(started.run_type.clone());
    store
        .create_run(&NewRun {
            run_id: started.run_id.clone(),
            model_identifier: config.target.client_id(),
            benchmark_version: started.benchmark_version.clone(),
            config: config.to_json()?,
            labels: labels.to_vec(),
        })
        .await?;
    tracing::info!(run_id = %started.run_id, attempts = started.attempts.len(), "run started");

    Ok(PreparedRun {
        run_id: started.run_id,
        config,
        benchmark_version: started.benchmark_version,
        queue: started.attempts.clone(),
        all_attempts: started.attempts,
    })
}

/// Attempts of `all` not yet recorded, minus the one being skipped.
pub fn remaining_attempts(
    all: &[Attempt],
    completed: &HashSet<String>,
    skipped: Option<&str>,
) -> Vec<Attempt> {
    all.iter()
        .filter(|a| !completed.contains(&a.attempt_id))
        .filter(|a| Some(a.attempt_id.as_str()) != skipped)
        .cloned()
        .collect()
}

/// Rebuild the queue of a run that crashed.
///
/// With `Retry` the attempt that was in flight is reset on the server and
/// stays in the queue; with `Skip` it is recorded as an error and dropped.
pub async fn resume_failed_run(
    store: &dyn RunStore,
    scorer: &dyn Scorer,
    run_id: &str,
    mode: ResumeMode,
) -> Result<PreparedRun> {
    let failed = store
        .get_failed_run(run_id)
        .await?
        .ok_or_else(|| HarnessError::UnresumableRun(format!("run {} has no failure recorded", run_id)))?;
    println!("\n### SYSTEM: Found interrupted run with id: {}", run_id);

    let info = failed.failure_info;
    if info.all_attempts.is_empty() {
        return Err(HarnessError::UnresumableRun(
            "no attempts were recorded in the failure info".to_string(),
        )
        .into());
    }

    let mut skipped = None;
    if let Some(current) = &info.current_attempt {
        match mode {
            ResumeMode::Retry => {
                println!("Resetting attempt {}", current.attempt_id);
                if !scorer.reset_attempt(&current.attempt_id).await? {
                    println!("\n### SYSTEM ERROR: Failed to reset attempt, exiting.");
                    return Err(HarnessError::UnresumableRun(format!(
                        "server refused to reset attempt {}",
                        current.attempt_id
                    ))
                    .into());
                }
            }
            ResumeMode::Skip => {
                println!("Skipping attempt {}", current.attempt_id);
                store.fail_attempt(run_id, &current.attempt_id).await?;
                skipped = Some(current.attempt_id.as_str());
            }
        }
    }

    let completed = store.get_completed_attempts(run_id).await?;
    let queue = remaining_attempts(&info.all_attempts, &completed, skipped);
    println!("Found {} completed attempts", completed.len());
    println!("Remaining attempts to process: {}", queue.len());

    Ok(PreparedRun {
        run_id: run_id.to_string(),
        config: RunConfig::from_json(failed.config)?,
        benchmark_version: failed.benchmark_version,
        all_attempts: info.all_attempts,
        queue,
    })
}

/// Short name for the failure type stored with the run.
pub fn error_type(err: &anyhow::Error) -> String {
    if let Some(e) = err.downcast_ref::<HarnessError>() {
        e.variant_name().to_string()
    } else if let Some(e) = err.downcast_ref::<ProviderError>() {
        e.variant_name().to_string()
    } else if let Some(e) = err.downcast_ref::<ScorerError>() {
        e.variant_name().to_string()
    } else {
        "Error".to_string()
    }
}

pub fn failure_info(
    err: &anyhow::Error,
    current_attempt: Option<&Attempt>,
    all_attempts: &[Attempt],
) -> FailureInfo {
    FailureInfo {
        error_type: error_type(err),
        error_message: format!("{:#}", err),
        traceback: format!("{:?}", err),
        current_attempt: current_attempt.cloned(),
        all_attempts: all_attempts.to_vec(),
        failure_datetime: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

/// Commands that continue a failed run.
pub fn resume_commands(program: &str, provider: Provider, model: &str, run_id: &str) -> [String; 2] {
    [
        format!(
            "  {} {} {} {} --resume=skip   # Skip the failed attempt",
            program, provider, model, run_id
        ),
        format!(
            "  {} {} {} {} --resume=retry  # Retry the failed attempt",
            program, provider, model, run_id
        ),
    ]
}

/// Everything the attempt loop writes through.
pub struct RunContext<'a> {
    pub run_id: &'a str,
    pub env: AttemptEnv<'a>,
    pub store: &'a dyn RunStore,
    /// Echo transcripts to stdout.
    pub echo: bool,
}

impl RunContext<'_> {
    fn printer(&self) -> Printer {
        if self.echo {
            Printer::new()
        } else {
            Printer::silent(80)
        }
    }

    async fn record_failure(&self, info: &FailureInfo) {
        println!("\n### SYSTEM ERROR: An uncaught exception occurred");
        println!("Error type: {}", info.error_type);
        println!("Error message: {}", info.error_message);
        match self.store.save_run_failure(self.run_id, info).await {
            Ok(()) => println!("The error has been recorded in the database."),
            Err(err) => tracing::error!(error = %err, "couldn't record run failure"),
        }
    }
}

/// Run every attempt in `queue`, recording each as it finishes.
///
/// On the first error the failure (with the in-flight attempt and
/// `all_attempts`) is saved to the run row and the error is returned.
pub async fn process_attempts(
    ctx: &RunContext<'_>,
    all_attempts: &[Attempt],
    queue: &[Attempt],
) -> Result<()> {
    let started = Instant::now();
    let mut current: Option<&Attempt> = None;

    let outcome: Result<()> = async {
        for (i, attempt) in queue.iter().enumerate() {
            println!("{}", progress_line(i + 1, queue.len(), started.elapsed()));
            current = Some(attempt);
            let report = run_attempt(&ctx.env, attempt, ctx.printer()).await?;
            ctx.store.add_attempt(ctx.run_id, &report).await?;
            tracing::info!(
                attempt_id = %report.attempt_id,
                passed = report.passed,
                tool_calls = report.tool_calls,
                api_calls = report.api_calls,
                "attempt recorded"
            );
            current = None;
        }
        Ok(())
    }
    .await;

    if let Err(err) = outcome {
        let info = failure_info(&err, current, all_attempts);
        ctx.record_failure(&info).await;
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub completion: RunCompletion,
    pub pass_at_k: PassAtK,
}

/// Close the run with the scorer and store its result.
pub async fn complete_run(
    scorer: &dyn Scorer,
    store: &dyn RunStore,
    run_id: &str,
    model: &str,
    started: Instant,
    total_api_calls: u64,
) -> Result<RunSummary> {
    let completion = scorer.complete_run().await.context("complete-run request failed")?;
    store.add_problem_names(&completion.problem_names).await?;
    store
        .save_run_result(
            run_id,
            &RunResult {
                score: completion.score,
                percent: completion.percent,
                total_run_time: started.elapsed().as_secs_f64(),
                total_api_calls: total_api_calls as i64,
            },
        )
        .await?;
    let pass_at_k = store.calculate_pass_at_k(run_id).await?;

    let score = completion.score;
    let fraction = if score.denominator > 0 {
        score.numerator as f64 / score.denominator as f64
    } else {
        0.0
    };
    println!("\n### SYSTEM: run complete for model `{}`.", model);
    println!("\nRun id: {}", run_id);
    println!(
        "\nFinal score: {}/{} ({:.0}%)",
        score.numerator,
        score.denominator,
        fraction * 100.0
    );
    if pass_at_k.k > 1 {
        println!(
            "\nPass@{} score: {}/{} ({:.0}%)",
            pass_at_k.k,
            pass_at_k.problems_passed,
            pass_at_k.total_problems,
            pass_at_k.pass_at_k * 100.0
        );
    }

    Ok(RunSummary {
        completion,
        pass_at_k,
    })
}
