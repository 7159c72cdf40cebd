//! Core data model (§3): VMContext, VMDisk, BackupJob, BackupDisk,
//! BackupChain, PortAllocation, QemuExport, Repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job_id::JobId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmContextId(pub String);

impl std::fmt::Display for VmContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference into the (out-of-scope) credential store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmLifecycleState {
    Discovered,
    Replicating,
    BackingUp,
    Ready,
    /// Failover states are out of scope (§1); this single variant is enough
    /// for `StartBackup`'s precondition check to reject them uniformly.
    Failover,
}

impl VmLifecycleState {
    pub fn accepts_backup(self) -> bool {
        !matches!(self, VmLifecycleState::Failover)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmContext {
    pub context_id: VmContextId,
    pub vm_name: String,
    pub source_inventory_id: String,
    pub hypervisor_host: String,
    pub datacenter_path: String,
    pub credential_ref: CredentialRef,
    pub state: VmLifecycleState,
    pub total_jobs: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub last_scheduled_at: Option<DateTime<Utc>>,
}

/// A disk as it existed at the moment a job was created; historical rows
/// are retained as an audit trail of VM shape over time (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDisk {
    pub context_id: VmContextId,
    /// Hypervisor-assigned key, e.g. 2000, 2001. Disk correlation MUST use
    /// this, never ordinal position (§4.4, §9): VMs get reconfigured.
    pub disk_key: u32,
    pub logical_index: u32,
    pub capacity_bytes: u64,
    pub provisioning_hint: String,
    pub datastore: String,
    pub last_change_id: Option<String>,
    pub is_current: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPhase {
    Snapshotting,
    Transferring,
    Finalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskStatus {
    Pending,
    Snapshotting,
    Transferring,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub job_id: JobId,
    pub context_id: VmContextId,
    pub backup_type: BackupType,
    pub repository_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub bytes_transferred: u64,
    pub progress_percent: f64,
    pub phase: Option<BackupPhase>,
    pub speed_bps: f64,
    pub last_telemetry_at: Option<DateTime<Utc>>,
    pub force_full: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDisk {
    pub job_id: JobId,
    pub disk_key: u32,
    pub disk_index: u32,
    pub allocated_port: Option<u16>,
    pub export_name: String,
    pub qcow2_path: String,
    pub backing_file: Option<String>,
    pub parent_change_id: Option<String>,
    pub new_change_id: Option<String>,
    pub bytes_transferred: u64,
    pub status: DiskStatus,
    pub progress_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupChain {
    pub chain_id: String,
    pub context_id: VmContextId,
    pub disk_key: u32,
    pub full_backup_id: JobId,
    /// Ordered oldest-to-newest; the chain is a strict linear list (§4.5).
    pub incremental_backup_ids: Vec<JobId>,
}

impl BackupChain {
    pub fn latest_job_id(&self) -> &JobId {
        self.incremental_backup_ids
            .last()
            .unwrap_or(&self.full_backup_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortAllocation {
    pub port: u16,
    pub job_id: JobId,
    pub disk_index: u32,
    pub vm_name: String,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QemuExportStatus {
    Starting,
    Running,
    Stopped,
    Crashed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QemuExport {
    pub port: u16,
    pub export_name: String,
    pub qcow2_path: String,
    pub pid: i32,
    pub job_id: JobId,
    pub disk_index: u32,
    pub started_at: DateTime<Utc>,
    pub status: QemuExportStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub repository_id: String,
    pub name: String,
    pub root_path: String,
    pub capacity_hint_bytes: Option<u64>,
    pub enabled: bool,
}
