//! Telemetry push payload (§4.7, §6.1): `POST /telemetry/backup/{jobId}`.

use serde::{Deserialize, Serialize};

use crate::vm::{BackupPhase, DiskStatus, JobStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskTelemetry {
    pub index: u32,
    pub bytes: u64,
    pub total: u64,
    pub status: DiskStatus,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryUpdate {
    pub status: JobStatus,
    pub phase: BackupPhase,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub speed_bps: f64,
    pub eta_seconds: Option<u64>,
    pub progress_percent: f64,
    pub disks: Vec<DiskTelemetry>,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Per-disk result reported to `POST /backups/{id}/complete` (§6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskCompletionResult {
    pub disk_index: u32,
    pub new_change_id: Option<String>,
    pub bytes_transferred: u64,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub per_disk: Vec<DiskCompletionResult>,
}

/// Decides whether telemetry is due to be pushed (§4.4): whenever any of
/// elapsed time, a 10%-milestone crossing, a phase change, or a terminal/
/// error condition has occurred since the last send.
pub struct TelemetryCadence {
    last_sent_at: std::time::Instant,
    last_percent_milestone: u64,
    last_phase: Option<BackupPhase>,
}

impl TelemetryCadence {
    pub fn new() -> Self {
        Self {
            last_sent_at: std::time::Instant::now(),
            last_percent_milestone: 0,
            last_phase: None,
        }
    }

    pub fn should_send(&self, phase: BackupPhase, percent: f64, is_error_or_terminal: bool) -> bool {
        if is_error_or_terminal {
            return true;
        }
        if self.last_phase != Some(phase) {
            return true;
        }
        if self.last_sent_at.elapsed().as_secs() >= 5 {
            return true;
        }
        let milestone = (percent / 10.0).floor() as u64;
        milestone > self.last_percent_milestone
    }

    pub fn record_sent(&mut self, phase: BackupPhase, percent: f64) {
        self.last_sent_at = std::time::Instant::now();
        self.last_phase = Some(phase);
        self.last_percent_milestone = (percent / 10.0).floor() as u64;
    }
}

impl Default for TelemetryCadence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sends_on_phase_change_and_milestone() {
        let mut cadence = TelemetryCadence::new();
        assert!(cadence.should_send(BackupPhase::Snapshotting, 0.0, false));
        cadence.record_sent(BackupPhase::Snapshotting, 0.0);

        assert!(!cadence.should_send(BackupPhase::Snapshotting, 5.0, false));
        assert!(cadence.should_send(BackupPhase::Snapshotting, 12.0, false));
        cadence.record_sent(BackupPhase::Snapshotting, 12.0);

        assert!(cadence.should_send(BackupPhase::Transferring, 12.0, false));
    }

    #[test]
    fn always_sends_terminal_or_error() {
        let cadence = TelemetryCadence::new();
        assert!(cadence.should_send(BackupPhase::Transferring, 3.0, true));
    }
}
