use anyhow::{bail, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use sherlockbench_client::config::{load_base_url, Credentials, Provider};
use sherlockbench_client::keyring;
use sherlockbench_client::report::{
    render_csv, render_problem_sets, render_table, render_tool_calls, summarize_rows,
};
use sherlockbench_client::scorer::HttpScorer;
use sherlockbench_client::store::PgStore;
use sherlockbench_client::util::{init_tracing, is_valid_uuid};
use std::io::{self, BufRead, Write};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "sherlockbench-tools",
    about = "Inspect and maintain SherlockBench results"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the problem sets the scoring server offers
    ListProblemSets,
    /// Attach a label to one or more runs
    Label(LabelArgs),
    /// Per-function success table for a set of runs
    Summarize(SummarizeArgs),
    /// Show the tool calls an attempt made
    PrintToolCalls(PrintToolCallsArgs),
    /// Store a provider API key in the system keychain
    SetApiKey(SetApiKeyArgs),
}

#[derive(Args, Debug)]
struct LabelArgs {
    #[arg(short, long)]
    label: String,
    #[arg(required = true)]
    run_ids: Vec<String>,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("selection").required(true).args(["run_ids", "labels"])))]
struct SummarizeArgs {
    #[arg(long, num_args = 1..)]
    run_ids: Vec<String>,
    #[arg(long, num_args = 1..)]
    labels: Vec<String>,
    /// Emit CSV instead of a table
    #[arg(long)]
    csv: bool,
    /// Order by success rate instead of name
    #[arg(long)]
    sort: bool,
}

#[derive(Args, Debug)]
struct PrintToolCallsArgs {
    attempt_id: String,
}

#[derive(Args, Debug)]
struct SetApiKeyArgs {
    #[arg(value_enum)]
    provider: Provider,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => return usage_exit(err),
    };
    let result = match cli.command {
        Commands::ListProblemSets => run_list_problem_sets().await,
        Commands::Label(args) => run_label(args).await,
        Commands::Summarize(args) => run_summarize(args).await,
        Commands::PrintToolCalls(args) => run_print_tool_calls(args).await,
        Commands::SetApiKey(args) => run_set_api_key(args),
    };
    match result {
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

async fn connect() -> Result<PgStore> {
    let credentials = Credentials::load()?;
    PgStore::connect(&credentials.database_url()?).await
}

fn check_uuids(ids: &[String]) -> Result<()> {
    let invalid: Vec<&str> = ids
        .iter()
        .filter(|id| !is_valid_uuid(id))
        .map(String::as_str)
        .collect();
    if !invalid.is_empty() {
        bail!("Invalid UUID format: {}", invalid.join(", "));
    }
    Ok(())
}

async fn run_list_problem_sets() -> Result<()> {
    let scorer = HttpScorer::new(&load_base_url()?)?;
    println!("{}", render_problem_sets(&scorer.problem_sets().await?));
    Ok(())
}

async fn run_label(args: LabelArgs) -> Result<()> {
    check_uuids(&args.run_ids)?;
    let store = connect().await?;

    let mut labelled = 0usize;
    for run_id in &args.run_ids {
        if store.add_label(run_id, &args.label).await? {
            println!("Added label '{}' to run '{}'", args.label, run_id);
            labelled += 1;
        } else {
            println!("Warning: Run '{}' not found in the database", run_id);
        }
    }
    if labelled == 0 {
        bail!("No runs were labelled");
    }
    Ok(())
}

async fn run_summarize(args: SummarizeArgs) -> Result<()> {
    let store = connect().await?;
    let run_ids = if args.labels.is_empty() {
        check_uuids(&args.run_ids)?;
        args.run_ids
    } else {
        let ids = store.run_ids_by_labels(&args.labels).await?;
        if ids.is_empty() {
            bail!("No runs carry the labels: {}", args.labels.join(", "));
        }
        ids
    };

    let summaries = summarize_rows(store.attempt_summary(&run_ids).await?, args.sort);
    if summaries.is_empty() {
        bail!("No attempts found for the selected runs");
    }
    if args.csv {
        println!("{}", render_csv(&summaries));
    } else {
        println!("{}", render_table(&summaries));
    }
    Ok(())
}

async fn run_print_tool_calls(args: PrintToolCallsArgs) -> Result<()> {
    check_uuids(std::slice::from_ref(&args.attempt_id))?;
    let store = connect().await?;
    let Some((log, function_name)) = store.attempt_log(&args.attempt_id).await? else {
        bail!("Attempt '{}' not found in the database", args.attempt_id);
    };
    let Some(log) = log else {
        bail!("Attempt '{}' has no stored log", args.attempt_id);
    };
    print!(
        "{}",
        render_tool_calls(&args.attempt_id, function_name.as_deref(), &log)
    );
    Ok(())
}

fn run_set_api_key(args: SetApiKeyArgs) -> Result<()> {
    print!("API key for {}: ", args.provider);
    io::stdout().flush()?;
    let mut key = String::new();
    io::stdin().lock().read_line(&mut key)?;
    let key = key.trim();
    if key.is_empty() {
        bail!("No key entered");
    }
    keyring::set_api_key(args.provider.as_str(), key).map_err(anyhow::Error::msg)?;
    println!("Stored API key for {} in the system keychain", args.provider);
    Ok(())
}
