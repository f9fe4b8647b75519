use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use photoferry::api::HttpRemote;
use photoferry::checkpoint::{Checkpoint, StepKind};
use photoferry::config::{self, RunConfig};
use photoferry::progress::ConsoleProgress;
use photoferry::sequencer;

#[derive(Debug, Parser)]
#[command(
    name = "photoferry",
    about = "Resumable media library migration into a remote photo service",
    version
)]
struct Cli {
    /// Path to the JSON run configuration.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the configured migration steps (the default).
    Migrate,
    /// Print the checkpoint state for the configured user.
    Status,
}

#[tokio::main]
async fn main() {
    photoferry::init_logging();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Migrate) {
        Commands::Migrate => migrate(&config).await,
        Commands::Status => status(&config),
    }
}

async fn migrate(config: &RunConfig) -> Result<()> {
    let remote = HttpRemote::new(&config.api_base_url, &config.api_key)
        .context("build remote service client")?;
    let mut progress = ConsoleProgress::new();

    sequencer::run(config, &remote, &mut progress)
        .await
        .context("migration interrupted; progress was saved, re-run to resume")?;
    Ok(())
}

fn status(config: &RunConfig) -> Result<()> {
    let path = config.progress_path();
    let checkpoint = Checkpoint::load(&path)
        .with_context(|| format!("load checkpoint {}", path.display()))?;

    println!("Checkpoint for {}: {}", config.user, path.display());
    println!("  interrupted:     {}", checkpoint.interrupted);
    for step in StepKind::ALL {
        let state = if checkpoint.step_completed(step) {
            "completed"
        } else {
            "pending"
        };
        println!("  {:<16} {state}", format!("{}:", step.label()));
    }
    println!("  assets mapped:   {}", checkpoint.asset_map.len());
    println!("  tags mapped:     {}", checkpoint.tag_map.len());
    println!("  stacks mapped:   {}", checkpoint.stack_map.len());
    println!("  albums mapped:   {}", checkpoint.album_map.len());
    println!("  stacks staged:   {}", checkpoint.stack_staging.len());
    println!("  trashed assets:  {}", checkpoint.trashed_assets.len());
    println!("  problem assets:  {}", checkpoint.problem_assets.len());
    println!("  problem stacks:  {}", checkpoint.problem_stacks.len());
    Ok(())
}
