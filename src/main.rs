use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use narrative_branch_engine::{
    cli::{execute_command, Cli, Commands},
    config::{Config, LogFormat},
    engine::{EngineCore, NarrativeEngine},
    generator::PipeGeneratorClient,
    storage::SqliteStorage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Narrative engine starting..."
    );

    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            Arc::new(s)
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    let generator = match PipeGeneratorClient::new(&config.generator, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %config.generator.base_url, "Generator client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize generator client");
            return Err(e.into());
        }
    };

    let command = cli.command.unwrap_or(Commands::Run);
    if command == Commands::Run {
        if let Err(e) = generator.ensure_pipe().await {
            error!(error = %e, "Failed to ensure generator pipe exists");
            return Err(e.into());
        }
    }

    let core = EngineCore::new(storage.clone(), Arc::new(generator), storage);
    let engine = NarrativeEngine::new(core, &config.permadeath);

    let result = execute_command(command, &engine, &config).await;
    if result.exit_code == 0 {
        println!("{}", result.message);
        info!("Shutdown complete");
        Ok(())
    } else {
        eprintln!("{}", result.message);
        std::process::exit(result.exit_code);
    }
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
