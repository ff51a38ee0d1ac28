//! unimark - unique-marker reconciliation CLI
//!
//! Runs check, repair, and clean jobs over a SQLite-backed entity
//! store and inspects their status records and discrepancy logs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use unimark_core::ReconcilerConfig;
use uuid::Uuid;

mod commands;

/// unimark - unique-marker reconciliation
#[derive(Parser, Debug)]
#[command(name = "unimark")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to reconciler configuration file
    #[arg(short, long, default_value = "unimark.toml")]
    config: PathBuf,

    /// Override the store path from configuration
    #[arg(long)]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a reconciliation job and wait for it to finish
    Run {
        /// Job kind
        #[arg(value_parser = ["check", "repair", "clean"])]
        kind: String,

        /// Target model name
        model: String,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "600")]
        timeout_secs: u64,
    },

    /// List submitted jobs
    #[command(alias = "ls")]
    Jobs {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one job's status
    Status {
        /// Job id
        job_id: Uuid,
    },

    /// Show a job's discrepancy log
    Logs {
        /// Job id
        job_id: Uuid,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List configured models and their unique constraints
    Models,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = if cli.config.exists() {
        ReconcilerConfig::from_file(&cli.config).with_context(|| {
            format!("failed to load configuration from {}", cli.config.display())
        })?
    } else {
        ReconcilerConfig::default()
    };
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    match cli.command {
        Commands::Run {
            kind,
            model,
            timeout_secs,
        } => commands::run(&config, &kind, &model, timeout_secs),
        Commands::Jobs { json } => commands::jobs(&config, json),
        Commands::Status { job_id } => commands::status(&config, job_id),
        Commands::Logs { job_id, json } => commands::logs(&config, job_id, json),
        Commands::Models => commands::models(&config),
    }
}
