//! CLI commands for operating the narrative engine.
//!
//! The binary runs the consequence sweeper as a daemon and exposes one-shot
//! maintenance and inspection commands for individual sessions.

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};

use crate::config::Config;
use crate::engine::{NarrativeEngine, Sweeper};

/// Narrative engine command line.
#[derive(Parser, Debug, Clone)]
#[command(name = "narrative-engine", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Engine subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the consequence sweeper until interrupted (default)
    Run,

    /// Fire all due consequences once and exit
    Sweep,

    /// Repair a session's pending consequence cache
    Reconcile {
        /// Session id
        #[arg(long)]
        session: String,
    },

    /// Print a session's story tree as JSON
    Tree {
        /// Session id
        #[arg(long)]
        session: String,
    },

    /// Print a session's live and archived branches as JSON
    Branches {
        /// Session id
        #[arg(long)]
        session: String,
    },
}

/// Result of CLI command execution.
#[derive(Debug)]
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute a CLI command.
pub async fn execute_command(
    command: Commands,
    engine: &NarrativeEngine,
    config: &Config,
) -> CliResult {
    match command {
        Commands::Run => execute_run(engine, config).await,
        Commands::Sweep => match engine.consequences().sweep().await {
            Ok(report) => json_result(&report),
            Err(e) => CliResult::error(format!("Sweep failed: {}", e)),
        },
        Commands::Reconcile { session } => match engine.consequences().reconcile(&session).await {
            Ok(untriggered) => CliResult::success(format!(
                "Session {} reconciled: {} untriggered consequences",
                session,
                untriggered.len()
            )),
            Err(e) => CliResult::error(format!("Reconcile failed: {}", e)),
        },
        Commands::Tree { session } => match engine.branches().story_tree(&session).await {
            Ok(tree) => json_result(&tree),
            Err(e) => CliResult::error(format!("Failed to load story tree: {}", e)),
        },
        Commands::Branches { session } => match engine.branches().all_branches(&session).await {
            Ok(branches) => json_result(&branches),
            Err(e) => CliResult::error(format!("Failed to load branches: {}", e)),
        },
    }
}

async fn execute_run(engine: &NarrativeEngine, config: &Config) -> CliResult {
    let handle = Sweeper::new(
        engine.consequences().clone(),
        config.scheduler.sweep_interval(),
    )
    .spawn();

    info!("Sweeper running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    match handle.shutdown().await {
        Ok(()) => CliResult::success("Sweeper stopped"),
        Err(e) => CliResult::error(format!("Sweeper task failed: {}", e)),
    }
}

fn json_result<T: Serialize>(value: &T) -> CliResult {
    match serde_json::to_string_pretty(value) {
        Ok(json) => CliResult::success(json),
        Err(e) => CliResult::error(format!("Failed to serialize output: {}", e)),
    }
}
