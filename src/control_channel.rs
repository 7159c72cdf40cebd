//! The engine's view of the SSH tunnel's control channel (§4.6, §9): a
//! single "start backup" request, issued once all ports are allocated and
//! every export is up.
//!
//! The tunnel forwards the control endpoint the same way it forwards NBD
//! ports (`vbr_tunnel::TunnelManager::add_forward`); what lands here is a
//! plain HTTP call to the now-local address of that forward, matching the
//! REST style the rest of the hub already uses.

use async_trait::async_trait;
use log::info;

use vbr_api_types::{CoreError, StartBackupAck, StartBackupRequest};

#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn start_backup(&self, control_addr: &str, request: StartBackupRequest) -> Result<(), CoreError>;
}

pub struct ReqwestControlChannel {
    client: reqwest::Client,
}

impl ReqwestControlChannel {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("building control channel http client"),
        }
    }
}

impl Default for ReqwestControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlChannel for ReqwestControlChannel {
    async fn start_backup(&self, control_addr: &str, request: StartBackupRequest) -> Result<(), CoreError> {
        let vm_context_id = request.vm_context_id.clone();
        let url = format!("http://{control_addr}/control/start-backup");

        info!(
            "control channel: invoking source backup client at {url} for job {} ({} disks)",
            request.job_id,
            request.targets.len()
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::ClientUnreachable {
                vm_context_id: vm_context_id.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(CoreError::ClientUnreachable {
                vm_context_id: vm_context_id.clone(),
                reason: format!("control endpoint returned {}", response.status()),
            });
        }

        let ack: StartBackupAck = response
            .json()
            .await
            .map_err(|e| CoreError::ClientUnreachable {
                vm_context_id: vm_context_id.clone(),
                reason: format!("malformed ack: {e}"),
            })?;
        if !ack.accepted {
            return Err(CoreError::ClientUnreachable {
                vm_context_id,
                reason: ack.message.unwrap_or_else(|| "client rejected the request".to_string()),
            });
        }
        Ok(())
    }
}
