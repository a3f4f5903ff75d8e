//! `idp-store` operator entry point.
//!
//! # Responsibility
//! - Load `.env`, initialize logging and resolve the storage provider once.
//! - `health`: open the backend and print the health JSON.
//! - `check-config`: validate configuration without opening anything.
//!
//! # Invariants
//! - An invalid provider exits non-zero before any backend is opened.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use idp_store_core::{core_version, init_logging, LoggingConfig, Storage, StorageConfig};
use log::info;

#[derive(Debug, Parser)]
#[command(name = "idp-store", version, about = "Provisioning metadata storage tools")]
struct Cli {
    /// Read settings from this file instead of `./.env`.
    #[arg(long, global = true)]
    env_file: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open the configured backend and print its health report.
    Health {
        /// Indent the JSON output.
        #[arg(long)]
        pretty: bool,
    },
    /// Parse configuration and report the selected provider.
    CheckConfig,
}

/// Loads `./.env` when present.
fn load_default_env() -> Result<()> {
    accept_missing(dotenvy::dotenv().map(|_| ()))
}

/// A missing file is normal outside local development; anything else, such
/// as a malformed line, is reported.
fn accept_missing(outcome: dotenvy::Result<()>) -> Result<()> {
    match outcome {
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other.context("failed to load ./.env"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
        }
        None => load_default_env()?,
    }

    let logging = LoggingConfig::from_lookup(|key| std::env::var(key).ok());
    init_logging(&logging.level, logging.dir.as_deref())
        .map_err(anyhow::Error::msg)
        .context("failed to initialize logging")?;

    let config = StorageConfig::from_env().context("invalid storage configuration")?;
    info!(
        "event=cli_start module=cli status=ok provider={} version={}",
        config.provider(),
        core_version()
    );

    match cli.command {
        Command::CheckConfig => {
            println!("provider={}", config.provider());
            Ok(())
        }
        Command::Health { pretty } => {
            let storage = Storage::open(config).context("failed to open storage")?;
            let report = storage.health();
            let body = report.to_json();
            let text = if pretty {
                serde_json::to_string_pretty(&body)?
            } else {
                serde_json::to_string(&body)?
            };
            println!("{text}");
            if !report.is_up() {
                bail!("storage backend is DOWN");
            }
            Ok(())
        }
    }
}
