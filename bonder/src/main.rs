// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use bonder_config::Config;
use bridge_bonder::config::BonderNodeConfig;
use bridge_bonder::node::run_bonder_node;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
    /// Overrides `dry-run` from the config file.
    #[clap(long)]
    pub dry_run: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    let mut config = BonderNodeConfig::load(&args.config_path)?;
    if args.dry_run {
        config.dry_run = true;
    }
    config.validate()?;
    info!(
        "Starting bonder node {} with {} chains",
        config.ordering.hostname,
        config.chains.len()
    );

    let prometheus_registry = prometheus::Registry::new();
    let cancel = CancellationToken::new();
    let handle = run_bonder_node(config, prometheus_registry, cancel.clone()).await?;

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        info!("Received ctrl-c, stopping");
        cancel.cancel();
    });

    handle
        .await
        .map_err(|e| anyhow::anyhow!("Task join error: {}", e))
}
