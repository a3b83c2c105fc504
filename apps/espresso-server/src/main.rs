use anyhow::Result;
use clap::{Parser, Subcommand};
use espresso::ShutdownOptions;
use espresso_bootstrap::{AppConfig, CliArgs};
use mimalloc::MiMalloc;

use std::path::{Path, PathBuf};

mod wiring;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Espresso Server - modular message runtime
#[derive(Parser)]
#[command(name = "espresso-server")]
#[command(about = "Espresso Server - modular message runtime")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port override for the message listener (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        port: cli.port,
        verbose: cli.verbose,
    };

    // Layered config:
    // 1) defaults -> 2) YAML (if provided) -> 3) env (APP__*) -> 4) CLI overrides
    // Also normalizes + creates server.home_dir.
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.as_ref().cloned().unwrap_or_default();
    espresso_bootstrap::init_logging_unified(&logging_config, Path::new(&config.server.home_dir));

    tracing::info!("Espresso Server starting");

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    // Dispatch subcommands (default: run)
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(config),
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    tracing::info!("Initializing modules…");
    let app = wiring::build_app(&config);
    tracing::debug!(?app, "app assembled");
    app.run(ShutdownOptions::Signals).await
}

fn check_config(config: AppConfig) -> Result<()> {
    tracing::info!("Checking configuration…");
    for (uid, bag) in &config.modules {
        tracing::debug!(module = %uid, keys = bag.as_object().map_or(0, |o| o.len()), "module config");
    }
    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(())
}
