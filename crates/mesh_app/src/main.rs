//! `mesh-sim`: starts a handful of mesh nodes in one process, seeds them as
//! a chain, and prints the topology the announce protocol converges on.
//!
//! Usage: `mesh-sim [config.json]`

mod logging;
mod sim;

use std::path::PathBuf;

use anyhow::Result;
use tracing::{error, info};

use crate::sim::SimConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => SimConfig::load(&path)?,
        None => SimConfig::default(),
    };

    let _log_guard = logging::init_logging(config.log_dir.as_deref(), &config.log_filter)?;
    info!(
        "Simulating {} node(s), settle timeout {}s",
        config.node_count,
        config.settle_timeout.as_secs()
    );

    match sim::run(&config).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!("Simulation failed: {e:#}");
            Err(e)
        }
    }
}
