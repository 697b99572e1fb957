//! Integrity Engine CLI
//!
//! Seal, verify and manage keys for hash-chained audit records.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use integrity_engine::{ChainId, EngineConfig, IntegrityEngine};

#[derive(Parser)]
#[command(name = "integrity-engine")]
#[command(about = "Seal and verify tamper-evident record chains")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); INTEGRITY__* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal one JSON payload onto a chain
    Seal {
        #[arg(long)]
        chain: String,

        /// JSON payload
        #[arg(long)]
        payload: String,
    },

    /// Seal every line of a JSONL file as one batch
    SealBatch {
        #[arg(long)]
        chain: String,

        #[arg(long)]
        file: PathBuf,
    },

    /// Verify a chain, optionally only a sequence range
    Verify {
        #[arg(long)]
        chain: String,

        #[arg(long)]
        from: Option<u64>,

        #[arg(long)]
        to: Option<u64>,
    },

    /// Activate a new signing key version
    RotateKeys,

    /// Print a public key (current version by default)
    PublicKey {
        #[arg(long)]
        version: Option<u32>,
    },

    /// Print engine status
    Status,
}

fn init_tracing(verbose: bool, quiet: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("integrity_engine=debug")
    } else if quiet {
        tracing_subscriber::EnvFilter::new("integrity_engine=error")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "integrity_engine=info".into())
    };

    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let config = EngineConfig::load(cli.config.as_deref())?;
    config
        .require_durable()
        .context("Refusing to seal into a store that will not survive this command")?;
    let engine = IntegrityEngine::connect(&config)
        .await
        .context("Failed to start integrity engine")?;

    match cli.command {
        Commands::Seal { chain, payload } => {
            let chain = ChainId::new(chain)?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;

            let record = engine.seal(&chain, &payload).await?;
            info!("Sealed {}", record.summary());
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Commands::SealBatch { chain, file } => {
            let chain = ChainId::new(chain)?;
            let contents = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {:?}", file))?;

            let mut payloads = Vec::new();
            for (line_num, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let payload: serde_json::Value = serde_json::from_str(line)
                    .map_err(|e| anyhow!("Invalid JSON at line {}: {}", line_num + 1, e))?;
                payloads.push(payload);
            }

            let records = engine.seal_batch(&chain, &payloads).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }

        Commands::Verify { chain, from, to } => {
            let chain = ChainId::new(chain)?;
            let report = engine.verify_chain(&chain, from, to).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !report.valid {
                error!("{}", report.summary());
                std::process::exit(1);
            }
        }

        Commands::RotateKeys => {
            let version = engine.rotate_keys().await?;
            let key = engine.get_public_key(Some(version)).await?;
            println!("{}", serde_json::to_string_pretty(&key)?);
        }

        Commands::PublicKey { version } => {
            let key = engine.get_public_key(version).await?;
            println!("{}", serde_json::to_string_pretty(&key)?);
        }

        Commands::Status => {
            let status = engine.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
