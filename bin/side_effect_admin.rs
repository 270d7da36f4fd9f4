//! # Side Effect Admin
//!
//! Operator tool for inspecting and invalidating side-effect records in Redis.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --features redis --bin side_effect_admin -- ping
//! cargo run --features redis --bin side_effect_admin -- status "src:<hash>:charge:inputs:<hash>"
//! cargo run --features redis --bin side_effect_admin -- clear "charge"
//! cargo run --features redis --bin side_effect_admin -- clear all
//! ```
//!
//! Settings come from `SideEffect.toml` (or `--config`) and `SIDE_EFFECT_*`
//! environment variables, the same sources the library reads.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use side_effect_guard::{
    redis_manager::{RedisConfig, RedisStore},
    Invalidator, OperationRecordStore, SideEffectSettings, StoreError,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "side_effect_admin", about = "Inspect and clear side-effect records")]
struct Cli {
    /// Settings file to load instead of `SideEffect.*`
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the Redis URL from settings
    #[arg(long)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check Redis connectivity
    Ping,
    /// Show whether an operation key is marked complete
    Status {
        /// Operation key, without the namespace prefix
        key: String,
    },
    /// Delete records matching a pattern (`all`, an operation name, or a key fragment)
    Clear {
        pattern: String,
    },
}

fn init_logging() {
    #[cfg(feature = "observability")]
    {
        tracing_subscriber::fmt().json().with_target(true).init();
    }
    #[cfg(not(feature = "observability"))]
    {
        env_logger::init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_logging();

    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => SideEffectSettings::from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => SideEffectSettings::new().context("Failed to load settings")?,
    };

    let mut redis_config = RedisConfig::from(&settings);
    if let Some(url) = cli.redis_url {
        redis_config.url = url;
    }
    let store = RedisStore::new(redis_config).await?;
    println!("✅ Connected to {} (prefix: {})", store.config().url, settings.side_effect_prefix);

    match cli.command {
        Command::Ping => {
            store.health_check().await?;
            println!("✅ Redis responded to PING");
        }
        Command::Status { key } => {
            let records = OperationRecordStore::new(Arc::new(store), settings.side_effect_prefix.clone());
            match records.completed_at(&key).await {
                Ok(Some(at)) => println!("✅ {} completed at {}", key, at.to_rfc3339()),
                Ok(None) => println!("⚠️  {} has no completion marker", key),
                // Marker written by another client in a different format
                Err(StoreError::Codec(_)) => println!("✅ {} completed (timestamp unreadable)", key),
                Err(e) => return Err(e.into()),
            }
        }
        Command::Clear { pattern } => {
            let invalidator = Invalidator::new(Arc::new(store), settings.side_effect_prefix.clone());
            let deleted = invalidator.clear(&pattern).await?;
            if deleted == 0 {
                println!("⚠️  No side effect keys matched '{}'", pattern);
            } else {
                println!("✅ Cleared {} side effect keys matching '{}'", deleted, pattern);
            }
        }
    }

    Ok(())
}
