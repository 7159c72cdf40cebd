//! Source-side control listener daemon (§4.6): binds loopback, waits for
//! the tunnel's reverse forward to deliver `StartBackup` calls from the
//! hub, and spawns `vbr-backup-client` for each one.

use std::path::PathBuf;

use anyhow::{Context as _, Error};
use clap::Parser;
use log::info;

use vbr_client::ListenerConfig;

#[derive(Parser, Debug)]
#[command(name = "vbr-control-listener", about = "Source-side control channel listener")]
struct Args {
    /// Local address to bind; the tunnel's reverse forward lands here.
    #[arg(long, default_value = "127.0.0.1:8500")]
    listen_addr: String,

    /// Path (or bare name resolved through `$PATH`) to the
    /// `vbr-backup-client` binary spawned for each request.
    #[arg(long, default_value = "vbr-backup-client")]
    backup_client_binary: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    let args = Args::parse();

    let app = vbr_client::control_listener_router(ListenerConfig { backup_client_binary: args.backup_client_binary });
    let listener = tokio::net::TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("binding control listener on {}", args.listen_addr))?;

    info!("vbr-control-listener: listening on {}", args.listen_addr);
    axum::serve(listener, app).await.context("control listener server terminated")?;

    Ok(())
}
