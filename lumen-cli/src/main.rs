//! Lumen CLI: host for the inference orchestration layer.
//!
//! Wires simulated backends into a `BackendManager` and exposes status,
//! synthetic workload, model catalog and configuration commands.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Lumen: inference backend orchestration for photo search
#[derive(Parser, Debug)]
#[command(name = "lumen", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Show system resources and backend status
    Status,
    /// Run a synthetic workload through the scheduler
    Simulate {
        /// Number of tasks to submit
        #[arg(short, long, default_value = "20")]
        tasks: usize,
        /// Override max concurrent tasks
        #[arg(short, long)]
        concurrency: Option<usize>,
    },
    /// Manage the model catalog
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration to .lumen/config.toml
    Init,
    /// Show the effective configuration
    Show,
}

#[derive(clap::Subcommand, Debug)]
enum ModelsAction {
    /// List catalog models
    List {
        /// Catalog file (defaults to the configured catalog)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Search the catalog
    Search {
        /// Task type, e.g. face_detection
        #[arg(long)]
        task: Option<String>,
        /// Acceptable formats, comma separated
        #[arg(long, value_delimiter = ',')]
        format: Vec<String>,
        /// Maximum memory footprint in MB
        #[arg(long)]
        max_memory: Option<f64>,
        /// Minimum accuracy (0.0 - 1.0)
        #[arg(long)]
        min_accuracy: Option<f64>,
        /// Free-text match on name or description
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Export the catalog to a JSON file
    Export {
        /// Destination file
        path: PathBuf,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Import models from a JSON export into the catalog
    Import {
        /// Source file
        path: PathBuf,
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "lumen", "lumen")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "lumen.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = lumen_core::config::load_config(Some(&workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    commands::handle_command(cli.command, config, &workspace).await
}
