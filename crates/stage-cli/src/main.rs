#![forbid(unsafe_code)]

//! **stage-cli** – Command-line interface for the staging engine.
//!
//! A thin driver over `stage-runtime`: create a stage bound to an in-process
//! peer channel, run one operation against it, and print the result. Useful
//! for scripting and local experimentation; a production deployment would
//! swap the in-process channel for a real transport adapter.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stage_bus_core::InProcessPeerChannel;
use stage_runtime::{Stage, StageConfig};
use stage_types::{BranchName, RepoId, Transaction, UserId};

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "stage")]
#[command(about = "Content-addressed, peer-synced staging engine CLI")]
#[command(version)]
struct Cli {
    /// User identifier under which this invocation operates.
    #[arg(long, default_value = "local")]
    user: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new repository with an initial value.
    CreateRepo {
        /// Human-readable description.
        #[arg(long)]
        description: String,
        /// Initial value, as a JSON literal.
        #[arg(long, default_value = "null")]
        init_val: String,
        /// Initial branch name.
        #[arg(long, default_value = "main")]
        branch: String,
    },
    /// Stage a transaction against a branch without committing it.
    Transact {
        /// Repository id (UUID).
        #[arg(long)]
        repo: String,
        /// Branch name.
        #[arg(long, default_value = "main")]
        branch: String,
        /// Transaction function identifier (e.g. "set", "merge").
        #[arg(long, default_value = "set")]
        trans_fn: String,
        /// Transaction parameters, as a JSON literal.
        #[arg(long)]
        params: String,
    },
    /// Fold every staged transaction into a new commit.
    Commit {
        /// Repository id (UUID).
        #[arg(long)]
        repo: String,
        /// Branch name.
        #[arg(long, default_value = "main")]
        branch: String,
    },
    /// Resolve a conflicting branch with a merge commit.
    Merge {
        /// Repository id (UUID).
        #[arg(long)]
        repo: String,
        /// Branch name.
        #[arg(long, default_value = "main")]
        branch: String,
        /// Back off a randomized delay proportional to the branch's
        /// historical merge rate before committing, to damp concurrent
        /// merge storms.
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Run the stage loop in the foreground, printing observed branch
    /// values as they change (Ctrl+C to stop).
    Daemon,
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    info!("starting stage-cli v{}", env!("CARGO_PKG_VERSION"));

    let user = UserId::from(cli.user.as_str());
    let channel = Arc::new(InProcessPeerChannel::new(1024));
    let stage = Stage::create_stage_with_builtins(channel, StageConfig::default());

    match cli.command {
        Commands::CreateRepo { description, init_val, branch } => {
            let init_val: serde_json::Value = serde_json::from_str(&init_val)?;
            let repo_id =
                stage.create_repo(user, &description, init_val, BranchName::from(branch.as_str())).await?;
            println!("created repository {repo_id}");
        }
        Commands::Transact { repo, branch, trans_fn, params } => {
            let repo_id = parse_repo_id(&repo)?;
            let params: serde_json::Value = serde_json::from_str(&params)?;
            let state = stage
                .transact(user, repo_id, BranchName::from(branch.as_str()), vec![Transaction::new(params, trans_fn.as_str())])
                .await?;
            println!("{state:?}");
        }
        Commands::Commit { repo, branch } => {
            let repo_id = parse_repo_id(&repo)?;
            stage.commit(vec![(user, repo_id, BranchName::from(branch.as_str()))]).await?;
            println!("committed");
        }
        Commands::Merge { repo, branch, wait } => {
            let repo_id = parse_repo_id(&repo)?;
            let merged = stage.merge(user, repo_id, BranchName::from(branch.as_str()), Vec::new(), wait).await?;
            if merged {
                println!("merged");
            } else {
                println!("skipped: branch advanced during backoff");
            }
        }
        Commands::Daemon => {
            handle_daemon(&stage).await?;
        }
    }

    Ok(())
}

//─────────────────────────────
//  Command handlers
//─────────────────────────────

async fn handle_daemon(stage: &Stage) -> Result<()> {
    println!("stage-cli daemon running (Ctrl+C to stop)");
    let mut rx = stage.subscribe();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let value = rx.borrow().clone();
                println!("{}", serde_json::to_string_pretty(&format!("{value:?}"))?);
            }
            _ = &mut ctrl_c => {
                println!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

//─────────────────────────────
//  Utility functions
//─────────────────────────────

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
    Ok(())
}

fn parse_repo_id(s: &str) -> Result<RepoId> {
    Ok(RepoId(uuid::Uuid::parse_str(s)?))
}
