use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use platelink_core::{IncomingBatch, PrimaryEntry};
use platelink_reconcile::{ReconcileConfig, Reconciler};
use platelink_storage::{SqliteKvStore, StoreConfig};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "platelink")]
#[command(about = "Reconcile chassis/plate associations in bulk", long_about = None)]
struct Cli {
    /// SQLite database holding the association store.
    #[arg(long, global = true, env = "PLATELINK_DB", default_value = "platelink.db")]
    db: PathBuf,
    #[arg(long, global = true, default_value_t = 5000)]
    operation_timeout_ms: u64,
    #[arg(long, global = true, default_value_t = 1)]
    connect_attempts: u32,
    /// Linear backoff step between CAS attempts.
    #[arg(long, global = true, default_value_t = 50)]
    base_delay_ms: u64,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile a JSON batch (array of records, or {batchTag, records})
    Ingest {
        file: PathBuf,
        #[arg(long)]
        batch_tag: Option<String>,
    },
    /// Show the entry stored for a chassis id
    Primary { id: String },
    /// Show which chassis a plate points at
    Secondary { id: String },
    /// List chassis ids created by a batch
    Batch { tag: String },
    /// Remove every association key
    Clear,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SecondaryView {
    secondary_id: String,
    primary_id: String,
    entry: Option<PrimaryEntry>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let store_config = StoreConfig {
        operation_timeout: Duration::from_millis(cli.operation_timeout_ms),
        connect_attempts: cli.connect_attempts,
        ..StoreConfig::file(&cli.db)
    };
    let store = SqliteKvStore::connect(&store_config)
        .with_context(|| format!("Failed to open store at {}", cli.db.display()))?;
    let reconciler = Reconciler::new(
        &store,
        ReconcileConfig::with_base_delay(Duration::from_millis(cli.base_delay_ms)),
    );

    match cli.command {
        Commands::Ingest { file, batch_tag } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let batch = IncomingBatch::parse_json(&raw)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            let tag = batch_tag.or(batch.batch_tag);
            let outcome = reconciler
                .process_batch(&batch.records, tag.as_deref())
                .context("Batch rejected")?;
            print_json(&outcome)?;
            if !outcome.is_clean() {
                std::process::exit(2);
            }
        }
        Commands::Primary { id } => {
            let entry = reconciler.directory().get_by_primary(&id)?;
            print_json(&entry)?;
        }
        Commands::Secondary { id } => {
            let view = reconciler
                .directory()
                .get_by_secondary(&id)?
                .map(|lookup| SecondaryView {
                    secondary_id: id,
                    primary_id: lookup.primary_id,
                    entry: lookup.entry,
                });
            print_json(&view)?;
        }
        Commands::Batch { tag } => {
            let members = reconciler.directory().batch_members(&tag)?;
            print_json(&members)?;
        }
        Commands::Clear => {
            let removed = reconciler.directory().clear_all()?;
            info!(event = "cli_clear", removed);
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{rendered}");
    Ok(())
}

fn init_logging(debug: bool) {
    let level = log_level(
        debug || env_true("PLATELINK_DEBUG"),
        std::env::var("PLATELINK_LOG_LEVEL").ok(),
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging already initialised");
    }
}

/// Fallback level when `RUST_LOG` is unset. The debug flag beats the env level.
fn log_level(debug: bool, env_level: Option<String>) -> String {
    if debug {
        "debug".to_string()
    } else if let Some(level) = env_level {
        level
    } else {
        "info".to_string()
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
