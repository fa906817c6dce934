use anyhow::{bail, Context, Result};
use clap::Parser;
use sherlockbench_client::bench::{AttemptEnv, HarnessError};
use sherlockbench_client::config::{Credentials, ModelTarget, Provider, RunConfig, RunMode};
use sherlockbench_client::llm::{build_model, RateLimitedModel};
use sherlockbench_client::report::render_problem_sets;
use sherlockbench_client::run::{
    complete_run, error_type, process_attempts, resume_commands, resume_failed_run,
    start_new_run, ProviderLock, ResumeMode, RunContext,
};
use sherlockbench_client::scorer::HttpScorer;
use sherlockbench_client::store::PgStore;
use sherlockbench_client::util::{init_tracing, is_valid_uuid};
use std::process::ExitCode;
use std::time::Instant;

const PROGRAM: &str = "sherlockbench";

#[derive(Parser, Debug)]
#[command(
    name = "sherlockbench",
    about = "Run the SherlockBench benchmark against an LLM provider",
    version
)]
struct Args {
    /// Provider of the model under test
    #[arg(value_enum)]
    provider: Provider,

    /// Model name as configured under [providers.<provider>]
    model: String,

    /// Problem-set id, an existing run id, or `list` to show problem sets
    target: Option<String>,

    /// Attempts per problem (server default when omitted)
    #[arg(long)]
    attempts_per_problem: Option<u32>,

    /// Resume the failed run given as TARGET
    #[arg(long, value_enum)]
    resume: Option<ResumeMode>,

    /// Labels to attach to a new run
    #[arg(long, num_args = 1..)]
    labels: Vec<String>,

    /// Override the configured run mode
    #[arg(long, value_enum)]
    mode: Option<RunMode>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => return usage_exit(err),
    };
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

/// Help and version exit 0; any other parse failure exits 1.
fn usage_exit(err: clap::Error) -> ExitCode {
    let _ = err.print();
    if err.use_stderr() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn model_for(credentials: &Credentials, target: &ModelTarget) -> Result<RateLimitedModel> {
    let key = credentials.api_key(target.provider).ok_or_else(|| {
        HarnessError::MissingApiKey(
            target.provider.to_string(),
            target.provider.api_key_env().to_string(),
        )
    })?;
    build_model(target, key)
}

async fn run(args: Args) -> Result<()> {
    let mut config = RunConfig::load(args.provider, &args.model)?;

    if args.target.as_deref() == Some("list") {
        let scorer = HttpScorer::new(&config.base_url)?;
        println!("{}", render_problem_sets(&scorer.problem_sets().await?));
        return Ok(());
    }

    if let Some(mode) = args.mode {
        config.run_mode = mode;
    }

    let resume = match (args.resume, args.target.as_deref()) {
        (Some(mode), Some(id)) if is_valid_uuid(id) => Some((mode, id.to_string())),
        (Some(_), Some(id)) => bail!("'{}' is not a valid run id", id),
        (Some(_), None) => bail!("--resume needs the id of the run to resume"),
        (None, _) => None,
    };

    let credentials = Credentials::load()?;
    let store = PgStore::connect(&credentials.database_url()?).await?;
    let base = HttpScorer::new(&config.base_url)?;

    let _lock = ProviderLock::acquire(args.provider).await?;

    let prepared = match resume {
        Some((mode, run_id)) => {
            let scorer = base.for_run(&run_id);
            let mut prepared = resume_failed_run(&store, &scorer, &run_id, mode).await?;
            if let Some(mode) = args.mode {
                prepared.config.run_mode = mode;
            }
            prepared
        }
        None => {
            start_new_run(
                &base,
                &store,
                config,
                args.target.as_deref(),
                args.attempts_per_problem,
                &args.labels,
            )
            .await?
        }
    };

    let config = &prepared.config;
    let scorer = base.for_run(&prepared.run_id);
    let model = model_for(&credentials, &config.target)?;
    let judge = match (config.run_mode, &config.decision) {
        (RunMode::ThreePhase, Some(target)) => Some(model_for(&credentials, target)?),
        _ => None,
    };
    println!("Using {} mode", config.run_mode.as_str());

    let env = AttemptEnv {
        model: &model,
        judge: judge.as_ref(),
        scorer: &scorer,
        mode: config.run_mode,
    };
    let ctx = RunContext {
        run_id: &prepared.run_id,
        env,
        store: &store,
        echo: true,
    };

    let started = Instant::now();
    if let Err(err) = process_attempts(&ctx, &prepared.all_attempts, &prepared.queue).await {
        println!("\n### SYSTEM ERROR: {}: {:#}", error_type(&err), err);
        println!("\nTo resume this run:");
        for line in resume_commands(PROGRAM, args.provider, &args.model, &prepared.run_id) {
            println!("{}", line);
        }
        return Err(err).context("run aborted");
    }

    complete_run(
        &scorer,
        &store,
        &prepared.run_id,
        &config.target.settings.model,
        started,
        env.total_calls(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_a_failing_usage_error() {
        let err = Args::try_parse_from(["sherlockbench", "openai"]).unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn test_help_is_not_a_failure() {
        let err = Args::try_parse_from(["sherlockbench", "--help"]).unwrap_err();
        assert!(!err.use_stderr());
    }

    #[test]
    fn test_resume_target_parses() {
        let args = Args::try_parse_from([
            "sherlockbench",
            "anthropic",
            "sonnet",
            "3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6b",
            "--resume",
            "retry",
        ])
        .unwrap();
        assert_eq!(args.provider, Provider::Anthropic);
        assert_eq!(args.resume, Some(ResumeMode::Retry));
    }
}
