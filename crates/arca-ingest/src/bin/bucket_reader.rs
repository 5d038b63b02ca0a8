//! Bucket reader binary: one polling pass over the receiving buckets.
//!
//! Designed to run from cron. Creates work items for new uploads, stamps
//! them queued at (Receive, Pending) where the fetch workers' registry poll
//! collects them, prints run statistics as JSON, and exits.

use anyhow::Result;
use arca_common::logging::{init_logging, LogConfig};
use arca_ingest::config::Config;
use arca_ingest::context::Context;
use arca_ingest::workers::BucketReader;
use clap::Parser;
use std::process;

#[derive(Parser)]
#[command(name = "bucket_reader", version, about = "Scans receiving buckets for new uploads")]
struct Cli {
    /// Path to the runtime config file
    #[arg(long)]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(3);
        }
    };
    if let Err(err) = run(cli).await {
        eprintln!("Error: {:#}", err);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    init_logging(&LogConfig::for_worker("bucket_reader", &config.log_directory).apply_env()?)?;
    let context = Context::new(config)?;

    let stats = BucketReader::new(context).run().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if stats.errors.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("bucket reader finished with {} errors", stats.errors.len())
    }
}
