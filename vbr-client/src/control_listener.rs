//! Source-side control listener (§4.6): the other end of
//! `vbr_hub::control_channel::ReqwestControlChannel`. Reachable only
//! through the tunnel's reverse forward onto `127.0.0.1:{control_port}`
//! (§4.6a), so this binds loopback-only and trusts its caller the same way
//! the hub trusts telemetry pushed back over the same tunnel.

use std::path::PathBuf;
use std::process::Stdio;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use log::{error, info};
use tokio::process::Command;

use vbr_api_types::{StartBackupAck, StartBackupRequest};

#[derive(Clone)]
pub struct ListenerConfig {
    /// Path to the `vbr-backup-client` binary; a bare name resolves
    /// through `$PATH`.
    pub backup_client_binary: PathBuf,
}

pub fn router(config: ListenerConfig) -> Router {
    Router::new().route("/control/start-backup", post(start_backup)).with_state(config)
}

async fn start_backup(
    State(config): State<ListenerConfig>,
    Json(request): Json<StartBackupRequest>,
) -> (StatusCode, Json<StartBackupAck>) {
    match spawn_backup_client(&config, &request) {
        Ok(()) => {
            info!(
                "control-listener: spawned vbr-backup-client for job {} ({} disk(s))",
                request.job_id,
                request.targets.len()
            );
            (StatusCode::OK, Json(StartBackupAck { accepted: true, message: None }))
        }
        Err(e) => {
            error!("control-listener: could not spawn vbr-backup-client for job {}: {e}", request.job_id);
            (StatusCode::OK, Json(StartBackupAck { accepted: false, message: Some(e.to_string()) }))
        }
    }
}

/// Translates one `StartBackupRequest` into the CLI invocation
/// `vbr-backup-client` expects (§6.3), then detaches it: the listener's
/// job ends at "the process started", matching the fire-and-collect
/// relationship the rest of the system already has with this binary --
/// progress and completion go straight from the child to the hub over
/// `TelemetryPusher`/`send_completion`, never back through here.
fn spawn_backup_client(config: &ListenerConfig, request: &StartBackupRequest) -> anyhow::Result<()> {
    let nbd_targets = request
        .targets
        .iter()
        .map(|t| t.nbd_target.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let disk_map = request
        .targets
        .iter()
        .map(|t| format!("{}:{}:{}", t.disk_index, t.disk_key, t.parent_change_id.as_deref().unwrap_or("-")))
        .collect::<Vec<_>>()
        .join(",");

    Command::new(&config.backup_client_binary)
        .arg("--nbd-targets")
        .arg(nbd_targets)
        .arg("--job-id")
        .arg(request.job_id.to_string())
        .arg("--hub-url")
        .arg(&request.hub_url)
        .arg("--vm-context-id")
        .arg(&request.vm_context_id)
        .arg("--hypervisor-host")
        .arg(&request.hypervisor_host)
        .arg("--source-inventory-id")
        .arg(&request.source_inventory_id)
        .arg("--credential-ref")
        .arg(&request.credential_ref.0)
        .arg("--disk-map")
        .arg(disk_map)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_map_uses_dash_for_missing_parent_change_id() {
        let request = StartBackupRequest {
            job_id: "job-20260101-000000.000-000001".parse().unwrap(),
            vm_context_id: "ctx-1".to_string(),
            vm_name: "vm-1".to_string(),
            source_inventory_id: "vm-42".to_string(),
            hypervisor_host: "vcenter.example.com".to_string(),
            credential_ref: vbr_api_types::CredentialRef("vcenter-prod".to_string()),
            hub_url: "https://hub.example".to_string(),
            targets: vec![vbr_api_types::StartBackupTarget {
                disk_index: 0,
                disk_key: 2000,
                nbd_target: "disk0:nbd://127.0.0.1:10100/disk0".parse().unwrap(),
                parent_change_id: None,
            }],
        };
        let config = ListenerConfig { backup_client_binary: PathBuf::from("/bin/true") };
        // `/bin/true` always spawns successfully; this only exercises the
        // argument-translation path, not the child's behavior.
        assert!(spawn_backup_client(&config, &request).is_ok());
    }
}
