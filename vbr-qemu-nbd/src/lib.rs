//! qemu-nbd Process Manager (§4.3): owns the lifecycle of one `qemu-nbd`
//! child per active export.
//!
//! Follows the same idiom `proxmox-file-restore`'s `qemu_helper.rs` uses
//! for supervising an external QEMU-family binary: spawn via
//! `std::process::Command`-equivalent, track the PID, probe liveness with
//! `kill(pid, None)`, escalate SIGTERM -> SIGKILL, always reap with `wait()`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Error};
use chrono::Utc;
use log::{info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::Mutex;
use tokio::time::sleep;

use vbr_api_types::{CoreError, JobId, QemuExport, QemuExportStatus};
use vbr_buildcfg::{GRACEFUL_STOP_TIMEOUT_SECS, QEMU_NBD_MIN_SHARED, QEMU_NBD_MONITOR_INTERVAL_SECS};

struct Tracked {
    export: QemuExport,
    monitor: tokio::task::JoinHandle<()>,
}

pub struct QemuNbdManager {
    binary_path: PathBuf,
    run_dir: PathBuf,
    state: Arc<Mutex<HashMap<u16, Tracked>>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QemuNbdMetrics {
    pub process_count: usize,
    pub ports: Vec<u16>,
}

impl QemuNbdManager {
    pub fn new(binary_path: impl Into<PathBuf>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            run_dir: run_dir.into(),
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn pidfile_path(&self, port: u16) -> PathBuf {
        self.run_dir.join(format!("qemu-nbd-{port}.pid"))
    }

    /// Start a qemu-nbd child serving `file_path` as export `export_name` on
    /// `port`. `--shared >= 10` is a hard contract (§9), not a tunable: the
    /// source client opens a data and a metadata connection per export.
    pub async fn start(
        &self,
        port: u16,
        export_name: &str,
        file_path: &Path,
        job_id: &JobId,
        disk_index: u32,
    ) -> Result<QemuExport, CoreError> {
        {
            let state = self.state.lock().await;
            if state.contains_key(&port) {
                return Err(CoreError::QemuStart {
                    disk_index,
                    port,
                    reason: "port already bound to a tracked export".to_string(),
                });
            }
        }

        tokio::fs::create_dir_all(&self.run_dir)
            .await
            .map_err(|e| CoreError::QemuStart {
                disk_index,
                port,
                reason: format!("could not create run dir: {e}"),
            })?;
        let pidfile = self.pidfile_path(port);
        let _ = tokio::fs::remove_file(&pidfile).await;

        let mut cmd = tokio::process::Command::new(&self.binary_path);
        cmd.arg("-f")
            .arg("qcow2")
            .arg("-x")
            .arg(export_name)
            .arg("-p")
            .arg(port.to_string())
            .arg("-b")
            .arg("0.0.0.0") // only reachable via the SSH tunnel's local endpoint, see §9
            .arg("--shared")
            .arg(QEMU_NBD_MIN_SHARED.to_string())
            .arg("--cache=writethrough")
            .arg("--pid-file")
            .arg(&pidfile)
            .arg(file_path)
            .kill_on_drop(false);

        info!(
            "qemu-nbd manager: starting export '{export_name}' for job {job_id} disk {disk_index} on port {port} ({})",
            file_path.display()
        );

        let status = cmd.status().await.map_err(|e| CoreError::QemuStart {
            disk_index,
            port,
            reason: format!("failed to spawn qemu-nbd: {e}"),
        })?;
        if !status.success() {
            return Err(CoreError::QemuStart {
                disk_index,
                port,
                reason: format!("qemu-nbd exited immediately with {status}"),
            });
        }

        let pid = self
            .read_pidfile(&pidfile)
            .await
            .map_err(|e| CoreError::QemuStart {
                disk_index,
                port,
                reason: e.to_string(),
            })?;

        let export = QemuExport {
            port,
            export_name: export_name.to_string(),
            qcow2_path: file_path.display().to_string(),
            pid,
            job_id: job_id.clone(),
            disk_index,
            started_at: Utc::now(),
            status: QemuExportStatus::Running,
        };

        let monitor_state = self.state.clone();
        let monitor = tokio::spawn(Self::monitor(monitor_state, port, pid));

        self.state.lock().await.insert(
            port,
            Tracked {
                export: export.clone(),
                monitor,
            },
        );

        Ok(export)
    }

    async fn read_pidfile(&self, pidfile: &Path) -> Result<i32, Error> {
        // qemu-nbd daemonizes and writes the real (forked) pid once ready;
        // poll briefly rather than racing the write.
        for _ in 0..50 {
            if let Ok(contents) = tokio::fs::read_to_string(pidfile).await {
                if let Ok(pid) = contents.trim().parse::<i32>() {
                    return Ok(pid);
                }
            }
            sleep(Duration::from_millis(100)).await;
        }
        Err(anyhow::anyhow!(
            "timed out waiting for qemu-nbd pid file {}",
            pidfile.display()
        ))
        .context("qemu-nbd startup")
    }

    /// Background health probe, 30s cadence (§4.3). Never holds the map
    /// lock while doing the liveness check itself.
    async fn monitor(state: Arc<Mutex<HashMap<u16, Tracked>>>, port: u16, pid: i32) {
        loop {
            sleep(Duration::from_secs(QEMU_NBD_MONITOR_INTERVAL_SECS)).await;

            let alive = kill(Pid::from_raw(pid), None).is_ok();
            if alive {
                continue;
            }

            let mut state = state.lock().await;
            if let Some(tracked) = state.get(&port) {
                if tracked.export.pid == pid {
                    warn!(
                        "qemu-nbd manager: export on port {port} (pid {pid}, job {}) is no longer running -- crash detected",
                        tracked.export.job_id
                    );
                    state.remove(&port);
                }
            }
            return;
        }
    }

    /// Stop the export on `port`: SIGTERM, wait up to 5s, then SIGKILL.
    /// Always reaps to avoid zombies. No-op (and no error) if already
    /// stopped (§8 property 9).
    pub async fn stop(&self, port: u16) -> Result<(), Error> {
        let tracked = { self.state.lock().await.remove(&port) };
        let Some(tracked) = tracked else {
            return Ok(());
        };
        tracked.monitor.abort();

        let pid = Pid::from_raw(tracked.export.pid);
        if kill(pid, Signal::SIGTERM).is_ok() {
            let deadline = Duration::from_secs(GRACEFUL_STOP_TIMEOUT_SECS);
            let step = Duration::from_millis(100);
            let mut waited = Duration::ZERO;
            while waited < deadline {
                if kill(pid, None).is_err() {
                    break; // process is gone
                }
                sleep(step).await;
                waited += step;
            }
            if kill(pid, None).is_ok() {
                warn!(
                    "qemu-nbd manager: port {port} (pid {}) did not exit within {}s, sending SIGKILL",
                    tracked.export.pid, GRACEFUL_STOP_TIMEOUT_SECS
                );
                let _ = kill(pid, Signal::SIGKILL);
            }
        }

        // Reap: qemu-nbd daemonizes, so there's no direct child to wait()
        // on from this process; best-effort reap of a same-pgid zombie is
        // handled by the OS once the forked daemon's session leader exits.
        let uptime = Utc::now().signed_duration_since(tracked.export.started_at);
        info!(
            "qemu-nbd manager: stopped export on port {port} (job {}, uptime {}s)",
            tracked.export.job_id,
            uptime.num_seconds()
        );
        Ok(())
    }

    pub async fn stop_by_job_id(&self, job_id: &JobId) -> usize {
        let ports: Vec<u16> = {
            let state = self.state.lock().await;
            state
                .values()
                .filter(|t| &t.export.job_id == job_id)
                .map(|t| t.export.port)
                .collect()
        };
        let count = ports.len();
        for port in ports {
            let _ = self.stop(port).await;
        }
        count
    }

    pub async fn metrics(&self) -> QemuNbdMetrics {
        let state = self.state.lock().await;
        QemuNbdMetrics {
            process_count: state.len(),
            ports: state.keys().copied().collect(),
        }
    }

    pub async fn snapshot(&self) -> Vec<QemuExport> {
        let state = self.state.lock().await;
        state.values().map(|t| t.export.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobId {
        "job-20260101-000000.000-000001".parse().unwrap()
    }

    #[tokio::test]
    async fn stopping_untracked_port_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = QemuNbdManager::new("/usr/bin/qemu-nbd", dir.path());
        manager.stop(10100).await.unwrap();
        assert_eq!(manager.metrics().await.process_count, 0);
    }

    #[tokio::test]
    async fn stop_by_job_id_on_empty_manager_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let manager = QemuNbdManager::new("/usr/bin/qemu-nbd", dir.path());
        assert_eq!(manager.stop_by_job_id(&job()).await, 0);
    }

    #[tokio::test]
    async fn start_rejects_a_port_already_tracked() {
        // Exercises only the pre-check, not an actual qemu-nbd spawn: insert
        // a fake entry directly and confirm `start` refuses the same port.
        let dir = tempfile::tempdir().unwrap();
        let manager = QemuNbdManager::new("/usr/bin/qemu-nbd", dir.path());
        let fake_export = QemuExport {
            port: 10100,
            export_name: "disk0".to_string(),
            qcow2_path: "/tmp/disk0.qcow2".to_string(),
            pid: std::process::id() as i32,
            job_id: job(),
            disk_index: 0,
            started_at: Utc::now(),
            status: QemuExportStatus::Running,
        };
        manager.state.lock().await.insert(
            10100,
            Tracked {
                export: fake_export,
                monitor: tokio::spawn(async {}),
            },
        );

        let err = manager
            .start(10100, "disk1", Path::new("/tmp/disk1.qcow2"), &job(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::QemuStart { .. }));
    }
}
