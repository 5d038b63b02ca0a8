//! Store worker binary: copies validated files to primary and replica
//! storage.

use anyhow::Result;
use arca_common::logging::{init_logging, LogConfig};
use arca_ingest::config::Config;
use arca_ingest::constants::{Action, Stage};
use arca_ingest::context::Context;
use arca_ingest::queue::{MemoryQueue, WorkQueue};
use arca_ingest::workers::common::run_registry_feed;
use arca_ingest::workers::StoreWorker;
use clap::Parser;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "store_worker", version, about = "Copies validated files to redundant long-term storage")]
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
    init_logging(&LogConfig::for_worker("store_worker", &config.log_directory).apply_env()?)?;
    let context = Context::new(config)?;

    let worker_cfg = context.config.store_worker.clone();
    let queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new(
        worker_cfg.timeout()?,
        worker_cfg.max_in_flight,
    ));
    tokio::spawn(run_registry_feed(
        context.clone(),
        Arc::clone(&queue),
        worker_cfg.queue_topic.clone(),
        vec![(Action::Ingest, Stage::Store)],
        worker_cfg.poll()?,
    ));

    StoreWorker::new(context)?.run(queue).await
}
