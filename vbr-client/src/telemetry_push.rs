//! Telemetry push (§4.4, §4.7, §6.1): aggregates per-disk progress into a
//! job-level `TelemetryUpdate` and sends it to the hub whenever
//! `TelemetryCadence` says it's due.

use std::collections::HashMap;
use std::time::Instant;

use log::warn;
use tokio::sync::Mutex;

use vbr_api_types::{BackupPhase, DiskStatus, DiskTelemetry, JobId, JobStatus, TelemetryCadence, TelemetryUpdate};

struct State {
    disks: HashMap<u32, DiskTelemetry>,
    cadence: TelemetryCadence,
    phase: BackupPhase,
    started_at: Instant,
}

pub struct TelemetryPusher {
    client: reqwest::Client,
    hub_url: String,
    job_id: JobId,
    state: Mutex<State>,
}

impl TelemetryPusher {
    pub fn new(hub_url: String, job_id: JobId, disk_count: u32) -> Self {
        let disks = (0..disk_count)
            .map(|i| (i, DiskTelemetry { index: i, bytes: 0, total: 0, status: DiskStatus::Pending, percent: 0.0 }))
            .collect();
        Self {
            client: reqwest::Client::new(),
            hub_url,
            job_id,
            state: Mutex::new(State {
                disks,
                cadence: TelemetryCadence::new(),
                phase: BackupPhase::Snapshotting,
                started_at: Instant::now(),
            }),
        }
    }

    /// Updates one disk's progress and pushes an aggregate update to the
    /// hub if `TelemetryCadence` decides this is a due send.
    pub async fn report_disk(&self, disk_index: u32, bytes: u64, total: u64, status: DiskStatus, percent: f64) {
        let phase = match status {
            DiskStatus::Completed | DiskStatus::Failed => BackupPhase::Finalizing,
            _ => BackupPhase::Transferring,
        };

        let (update, should_send) = {
            let mut state = self.state.lock().await;
            state.disks.insert(disk_index, DiskTelemetry { index: disk_index, bytes, total, status, percent });
            state.phase = phase;

            let is_terminal = status == DiskStatus::Failed;
            let overall_percent = self.overall_percent(&state.disks);
            let should_send = state.cadence.should_send(phase, overall_percent, is_terminal);
            if should_send {
                state.cadence.record_sent(phase, overall_percent);
            }
            (self.build_update(&state, overall_percent, None), should_send)
        };

        if should_send {
            self.push(update).await;
        }
    }

    pub async fn report_error(&self, message: &str) {
        let update = {
            let state = self.state.lock().await;
            let overall_percent = self.overall_percent(&state.disks);
            self.build_update(&state, overall_percent, Some(message.to_string()))
        };
        self.push(update).await;
    }

    fn overall_percent(&self, disks: &HashMap<u32, DiskTelemetry>) -> f64 {
        if disks.is_empty() {
            return 0.0;
        }
        disks.values().map(|d| d.percent).sum::<f64>() / disks.len() as f64
    }

    fn build_update(&self, state: &State, overall_percent: f64, error: Option<String>) -> TelemetryUpdate {
        let bytes_transferred: u64 = state.disks.values().map(|d| d.bytes).sum();
        let total_bytes: u64 = state.disks.values().map(|d| d.total).sum();
        let status = if error.is_some() { JobStatus::Failed } else { JobStatus::Running };

        let elapsed_secs = state.started_at.elapsed().as_secs_f64();
        let speed_bps = if elapsed_secs > 0.0 { bytes_transferred as f64 / elapsed_secs } else { 0.0 };
        let eta_seconds = if speed_bps > 0.0 && total_bytes > bytes_transferred {
            Some(((total_bytes - bytes_transferred) as f64 / speed_bps) as u64)
        } else {
            None
        };

        TelemetryUpdate {
            status,
            phase: state.phase,
            bytes_transferred,
            total_bytes,
            speed_bps,
            eta_seconds,
            progress_percent: overall_percent,
            disks: state.disks.values().cloned().collect(),
            error,
            timestamp: chrono::Utc::now(),
        }
    }

    async fn push(&self, update: TelemetryUpdate) {
        let url = format!("{}/telemetry/backup/{}", self.hub_url.trim_end_matches('/'), self.job_id);
        if let Err(e) = self.client.post(&url).json(&update).send().await {
            warn!("telemetry push to {url} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overall_percent_averages_across_disks() {
        let pusher = TelemetryPusher::new("https://hub.example".to_string(), "job-20260101-000000.000-000001".parse().unwrap(), 2);
        pusher.report_disk(0, 50, 100, DiskStatus::Transferring, 50.0).await;
        pusher.report_disk(1, 100, 100, DiskStatus::Completed, 100.0).await;
        let state = pusher.state.lock().await;
        assert_eq!(pusher.overall_percent(&state.disks), 75.0);
    }
}
