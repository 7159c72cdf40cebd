//! SSH Tunnel Manager (§4.6/§4.6a): one multiplexed SSH session carrying
//! NBD data, the control channel, and the reverse status channel.
//!
//! Grounded on the same external-process supervision idiom used for
//! qemu-nbd (`proxmox-file-restore`'s `qemu_helper.rs`): shell out to the
//! system binary, track the PID, probe liveness, escalate on failure to
//! stop, and in this case restart with backoff since losing the tunnel
//! mid-job is not fatal the way losing qemu-nbd is.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Error};
use log::{info, warn};
use tokio::sync::Mutex;
use tokio::time::sleep;

const BACKOFF_FLOOR_SECS: u64 = 5;
const BACKOFF_CAP_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub ssh_binary: PathBuf,
    pub control_path: PathBuf,
    pub remote_user: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub identity_file: Option<PathBuf>,
}

struct MasterState {
    /// `Some` once `ssh -M` has been spawned; the master process
    /// daemonizes into the background via `-f`, so we track liveness
    /// through `-O check` rather than a direct child handle.
    up: bool,
    forwards: Vec<u16>,
}

pub struct TunnelManager {
    config: TunnelConfig,
    state: Arc<Mutex<MasterState>>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(MasterState {
                up: false,
                forwards: Vec::new(),
            })),
        }
    }

    fn base_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.config.ssh_binary);
        cmd.arg("-S").arg(&self.config.control_path);
        cmd
    }

    async fn check_master(&self) -> bool {
        let mut cmd = self.base_command();
        cmd.arg("-O").arg("check").arg(self.target());
        cmd.status().await.map(|s| s.success()).unwrap_or(false)
    }

    fn target(&self) -> String {
        format!("{}@{}", self.config.remote_user, self.config.remote_host)
    }

    /// Bring the multiplexed master connection up if it is not already.
    /// Idempotent: calling this repeatedly while the master is healthy is
    /// a cheap no-op (`-O check`).
    pub async fn ensure_master(&self) -> Result<(), Error> {
        if self.check_master().await {
            self.state.lock().await.up = true;
            return Ok(());
        }

        let mut cmd = tokio::process::Command::new(&self.config.ssh_binary);
        cmd.arg("-M")
            .arg("-S")
            .arg(&self.config.control_path)
            .arg("-fN") // background once authenticated, no remote command
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-o")
            .arg("ServerAliveInterval=30")
            .arg("-o")
            .arg("ServerAliveCountMax=3")
            .arg("-p")
            .arg(self.config.remote_port.to_string());
        if let Some(identity) = &self.config.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(self.target());

        info!(
            "tunnel manager: bringing up SSH master to {} (control path {})",
            self.target(),
            self.config.control_path.display()
        );

        let status = cmd
            .status()
            .await
            .context("failed to spawn ssh master connection")?;
        if !status.success() {
            anyhow::bail!("ssh master connection exited with {status}");
        }

        self.state.lock().await.up = true;
        Ok(())
    }

    /// Add a local forward `127.0.0.1:local_port -> 127.0.0.1:remote_port`
    /// on the remote side, onto the already-established master connection.
    /// One forward per allocated NBD port (§4.6a).
    pub async fn add_forward(&self, local_port: u16, remote_port: u16) -> Result<(), Error> {
        self.ensure_master().await?;

        let mut cmd = self.base_command();
        cmd.arg("-O")
            .arg("forward")
            .arg("-L")
            .arg(format!("{local_port}:127.0.0.1:{remote_port}"))
            .arg(self.target());
        let status = cmd
            .status()
            .await
            .context("failed to add ssh port forward")?;
        if !status.success() {
            anyhow::bail!("ssh -O forward for port {local_port} exited with {status}");
        }

        self.state.lock().await.forwards.push(local_port);
        info!("tunnel manager: forwarding local port {local_port} -> remote {remote_port}");
        Ok(())
    }

    pub async fn remove_forward(&self, local_port: u16, remote_port: u16) -> Result<(), Error> {
        let mut cmd = self.base_command();
        cmd.arg("-O")
            .arg("cancel")
            .arg("-L")
            .arg(format!("{local_port}:127.0.0.1:{remote_port}"))
            .arg(self.target());
        let _ = cmd.status().await; // cancelling an already-gone forward is not fatal

        let mut state = self.state.lock().await;
        state.forwards.retain(|p| *p != local_port);
        Ok(())
    }

    pub async fn active_forward_count(&self) -> usize {
        self.state.lock().await.forwards.len()
    }

    /// Background supervisor: checks the master every `interval` and, on
    /// loss, re-establishes it with exponential backoff (5s floor, 60s
    /// cap) rather than hammering a host that is legitimately down.
    pub async fn supervise(self: Arc<Self>, interval: Duration) {
        let mut backoff = BACKOFF_FLOOR_SECS;
        loop {
            sleep(interval).await;

            if self.check_master().await {
                backoff = BACKOFF_FLOOR_SECS;
                continue;
            }

            self.state.lock().await.up = false;
            warn!(
                "tunnel manager: master connection to {} lost, retrying in {}s",
                self.target(),
                backoff
            );
            sleep(Duration::from_secs(backoff)).await;

            match self.ensure_master().await {
                Ok(()) => {
                    info!("tunnel manager: master connection to {} restored", self.target());
                    backoff = BACKOFF_FLOOR_SECS;
                }
                Err(e) => {
                    warn!("tunnel manager: reconnect attempt failed: {e}");
                    backoff = (backoff * 2).min(BACKOFF_CAP_SECS);
                }
            }
        }
    }

    pub async fn is_up(&self) -> bool {
        self.state.lock().await.up
    }

    /// Tear down the multiplexed connection, dropping every active
    /// forward with it.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let mut cmd = self.base_command();
        cmd.arg("-O").arg("exit").arg(self.target());
        let _ = cmd.status().await;
        let mut state = self.state.lock().await;
        state.up = false;
        state.forwards.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> TunnelConfig {
        TunnelConfig {
            ssh_binary: PathBuf::from("/usr/bin/ssh"),
            control_path: dir.join("ctrl.sock"),
            remote_user: "vbackup".to_string(),
            remote_host: "hub.example.com".to_string(),
            remote_port: 443,
            identity_file: None,
        }
    }

    #[tokio::test]
    async fn new_manager_starts_down_with_no_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TunnelManager::new(config(dir.path()));
        assert!(!manager.is_up().await);
        assert_eq!(manager.active_forward_count().await, 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = BACKOFF_FLOOR_SECS;
        let mut seen = vec![backoff];
        for _ in 0..5 {
            backoff = (backoff * 2).min(BACKOFF_CAP_SECS);
            seen.push(backoff);
        }
        assert_eq!(seen, vec![5, 10, 20, 40, 60, 60]);
    }
}
