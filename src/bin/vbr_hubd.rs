//! Hub daemon entry point (§2): loads the configuration, wires up
//! `HubState`, and serves the REST API while the stall detector and tunnel
//! supervisor run alongside it as background tasks.

use std::sync::Arc;

use anyhow::{Context as _, Error};
use clap::Parser;
use log::info;

use vbr_config::HubConfig;
use vbr_hub::state::HubState;
use vbr_hub::{rest, telemetry};

#[derive(Parser, Debug)]
#[command(name = "vbr-hubd", about = "VM backup hub daemon")]
struct Args {
    /// Path to the hub's TOML configuration file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(HubConfig::default_path);
    let config = HubConfig::load(&config_path)
        .with_context(|| format!("loading hub configuration from {}", config_path.display()))?;
    let listen_addr = config.hub.listen_addr.clone();

    let state = HubState::init(config).await.context("initializing hub state")?;

    tokio::spawn(telemetry::run_stall_detector(state.job_engine.clone()));
    tokio::spawn(state.tunnel.clone().supervise(std::time::Duration::from_secs(5)));

    let app = rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding hub REST listener on {listen_addr}"))?;

    info!("vbr-hubd: listening on {listen_addr}");
    axum::serve(listener, app).await.context("hub REST server terminated")?;

    Ok(())
}
