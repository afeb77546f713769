use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod output;

use commands::audit::{run_diff, run_sessions, run_show, run_trace};
use commands::config::run_config;
use commands::run::{RunMode, run_analyze, run_pipeline};

#[derive(Parser)]
#[command(name = "safeagent")]
#[command(about = "Guarded patch execution against a remote repository", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    /// Print trace events and pipeline notes to stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the files a run would offer to the model.
    Analyze(AnalyzeArgs),
    /// Plan with the model, then validate, apply, verify and publish.
    Run(RunArgs),
    /// Prepend a fixed marker to README.md; needs no model.
    RunManual(RunArgs),
    /// Execute a plan read from a JSON file.
    Apply(ApplyArgs),
    /// Recent audit records, newest first.
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Show {
        id: String,
    },
    /// Print the diff recorded for a run.
    Diff {
        id: String,
    },
    /// Print the state trace recorded for a run.
    Trace {
        id: String,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCmd,
    },
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Clone URL of the target repository.
    #[arg(long)]
    repo: String,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    repo: String,
    /// What the change should accomplish.
    prompt: String,
}

#[derive(Args)]
struct ApplyArgs {
    #[arg(long)]
    repo: String,
    /// JSON file holding `{"edits": [{"file_path", "original_hash", "unified_diff"}]}`.
    #[arg(long)]
    plan: PathBuf,
    /// Recorded as the run's intent and used for branch and title.
    #[arg(default_value = "Apply supplied plan")]
    prompt: String,
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the merged configuration with secrets redacted.
    Show,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;
    let json = cli.json;

    match cli.command {
        Commands::Analyze(args) => run_analyze(&cwd, &args.repo, json, cli.verbose),
        Commands::Run(args) => run_pipeline(
            &cwd,
            RunMode::Model,
            &args.repo,
            &args.prompt,
            json,
            cli.verbose,
        ),
        Commands::RunManual(args) => run_pipeline(
            &cwd,
            RunMode::Manual,
            &args.repo,
            &args.prompt,
            json,
            cli.verbose,
        ),
        Commands::Apply(args) => run_pipeline(
            &cwd,
            RunMode::PlanFile(args.plan),
            &args.repo,
            &args.prompt,
            json,
            cli.verbose,
        ),
        Commands::Sessions { limit } => run_sessions(&cwd, limit, json),
        Commands::Show { id } => run_show(&cwd, &id, json),
        Commands::Diff { id } => run_diff(&cwd, &id, json),
        Commands::Trace { id } => run_trace(&cwd, &id, json),
        Commands::Config { command } => match command {
            ConfigCmd::Show => run_config(&cwd, json),
        },
    }
}
