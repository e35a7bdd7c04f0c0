//! pilot CLI - entry point for the PR-lifecycle controller.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pilot_core::{Config, Controller, Notifier, Store};
use pilot_github::{GitHubClient, GitHubForge, GitHubTaskAdapter};
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Initializes logging with the requested verbosity, matching the
/// `-v`/`-vv`/`-vvv` convention the corpus CLIs use.
fn init_logging(verbose: u8, quiet: bool, json: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env().add_directive(format!("pilot={level}").parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_file(verbose >= 3)
        .with_line_number(verbose >= 3);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "pilot")]
#[command(about = "PR lifecycle controller: CI gating, merge automation, and release tagging")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State store path
    #[arg(long, env = "PILOT_DB_PATH", default_value = "~/.pilot/pilot.db")]
    db_path: String,

    /// Config file path (YAML)
    #[arg(long, env = "PILOT_CONFIG", default_value = "pilot.yaml")]
    config_path: String,

    /// `owner/repo` on GitHub
    #[arg(long, env = "PILOT_REPO")]
    repo: Option<String>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(short, long, global = true)]
    quiet: bool,

    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller loop until interrupted.
    Run,
    /// Validate the config file and exit.
    CheckConfig,
    /// Print the count of currently tracked PRs.
    Status,
}

struct NoopNotifier;

#[async_trait::async_trait]
impl Notifier for NoopNotifier {
    async fn merged(&self, pr_id: i64) -> pilot_core::forge::ForgeResult<()> {
        info!(pr_id, "PR merged");
        Ok(())
    }
    async fn ci_failed(&self, pr_id: i64, failed_checks: &[String]) -> pilot_core::forge::ForgeResult<()> {
        info!(pr_id, ?failed_checks, "CI failed");
        Ok(())
    }
    async fn approval_required(&self, pr_id: i64) -> pilot_core::forge::ForgeResult<()> {
        info!(pr_id, "approval required");
        Ok(())
    }
    async fn fix_task_created(&self, pr_id: i64, task_id: &str) -> pilot_core::forge::ForgeResult<()> {
        info!(pr_id, task_id, "fix task created");
        Ok(())
    }
    async fn released(&self, pr_id: i64, url: &str) -> pilot_core::forge::ForgeResult<()> {
        info!(pr_id, url, "released");
        Ok(())
    }
    async fn pipeline_complete(&self, pr_id: i64) -> pilot_core::forge::ForgeResult<()> {
        info!(pr_id, "pipeline complete");
        Ok(())
    }
}

fn load_config(path: &str) -> Result<Config> {
    let expanded = shellexpand::tilde(path).to_string();
    let yaml = std::fs::read_to_string(&expanded).with_context(|| format!("reading config at {expanded}"))?;
    Config::from_str(&yaml).with_context(|| format!("parsing config at {expanded}"))
}

fn split_repo(repo: &str) -> Result<(String, String)> {
    let (owner, name) = repo.split_once('/').context("--repo must be in owner/repo form")?;
    Ok((owner.to_string(), name.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.log_json)?;

    match cli.command {
        Commands::CheckConfig => {
            let config = load_config(&cli.config_path)?;
            println!("config OK: {} environment(s) configured", config.environments.len().max(1));
            let _ = config;
            return Ok(());
        }
        Commands::Status => {
            let db_path = shellexpand::tilde(&cli.db_path).to_string();
            let store = Store::open(&db_path).await?;
            let active = store.load_active_prs().await?;
            let failed = store.load_failed_prs().await?;
            println!("tracked: {} active, {} failed", active.len(), failed.len());
            return Ok(());
        }
        Commands::Run => {}
    }

    let config = load_config(&cli.config_path)?;
    let db_path = shellexpand::tilde(&cli.db_path).to_string();
    let db_path = PathBuf::from(db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(Store::open(&db_path).await?);

    let repo = cli.repo.context("--repo (or PILOT_REPO) is required to run the controller")?;
    let (owner, name) = split_repo(&repo)?;
    let token = std::env::var("GITHUB_TOKEN").context("GITHUB_TOKEN must be set")?;
    let client = GitHubClient::new(owner, name, token);
    let forge = Arc::new(GitHubForge::new(client.clone()));
    let task_adapter = Arc::new(GitHubTaskAdapter::new(client));
    let notifier = Arc::new(NoopNotifier);

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let controller = Controller::new(forge, task_adapter, None, notifier, store, config, cancel_rx);

    info!("starting controller loop");
    controller.run().await?;
    Ok(())
}
