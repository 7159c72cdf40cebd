//! The error taxonomy raised by the core (§7).
//!
//! Everything that is not a local, transient retry surfaces through one of
//! these variants so the Job Engine can decide rollback vs. pass-through
//! and the REST layer can pick a status code.

use thiserror::Error;

/// Phase names used in user-visible failure messages (§7: "name the phase
/// ... so operators can localise problems without consulting logs").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Snapshotting,
    Transferring,
    Finalizing,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Snapshotting => "snapshotting",
            Phase::Transferring => "transferring",
            Phase::Finalizing => "finalizing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    // -- configuration errors: surfaced before any side effect --
    #[error("configuration missing: {field}")]
    ConfigMissing { field: String },

    #[error("credential missing for reference '{reference}'")]
    CredentialMissing { reference: String },

    // -- lookup errors: 4xx, no rollback required --
    #[error("not found: {what}")]
    NotFound { what: String },

    // -- catalog errors: the SQLite-backed persistence layer itself failed --
    #[error("catalog error: {reason}")]
    Catalog { reason: String },

    // -- repository errors: qemu-img invocation or filesystem layout failed,
    // distinct from RepoFull which is specifically a capacity problem --
    #[error("repository '{repository_id}' image creation failed: {reason}")]
    RepositoryIo { repository_id: String, reason: String },

    // -- precondition errors: 4xx, no rollback required --
    #[error("VM '{vm_context_id}' is in a failover state and cannot be backed up")]
    VmInFailover { vm_context_id: String },

    #[error("no backup chain with a recorded change-id for disk {disk_index} of VM '{vm_context_id}'")]
    ChainMissing {
        vm_context_id: String,
        disk_index: u32,
    },

    #[error("a backup is already running for VM '{vm_context_id}'")]
    DuplicateBackup { vm_context_id: String },

    // -- resource errors: 5xx, caller may retry --
    #[error("NBD port pool exhausted: needed {needed}, {available} available")]
    PortsExhausted { needed: usize, available: usize },

    #[error("repository '{repository_id}' is full ({used_bytes} of {total_bytes} bytes used)")]
    RepoFull {
        repository_id: String,
        used_bytes: u64,
        total_bytes: u64,
    },

    // -- external-process errors: trigger full rollback --
    #[error("qemu-nbd failed to start for disk {disk_index} on port {port}: {reason}")]
    QemuStart {
        disk_index: u32,
        port: u16,
        reason: String,
    },

    #[error("qemu-nbd for disk {disk_index} on port {port} crashed: {reason}")]
    QemuCrashed {
        disk_index: u32,
        port: u16,
        reason: String,
    },

    #[error("snapshot failed for VM '{vm_context_id}': {reason}")]
    SnapshotFailed {
        vm_context_id: String,
        reason: String,
    },

    #[error("NBD I/O error on disk {disk_index} during {phase}: {reason}")]
    NbdIo {
        disk_index: u32,
        phase: Phase,
        reason: String,
    },

    #[error("source backup client unreachable for VM '{vm_context_id}': {reason}")]
    ClientUnreachable {
        vm_context_id: String,
        reason: String,
    },

    // -- tunnel errors manifest as stalls, but the tunnel layer itself can
    // still refuse to start synchronously --
    #[error("SSH tunnel unavailable: {reason}")]
    TunnelUnavailable { reason: String },

    #[error("job '{job_id}' stalled -- no telemetry for {elapsed_secs}s")]
    Stalled { job_id: String, elapsed_secs: i64 },
}

impl CoreError {
    /// Whether this error requires the Job Engine to run the full rollback
    /// procedure (§4.1: stop qemu-nbd children, release ports, mark disks
    /// failed) as opposed to a plain precondition rejection.
    pub fn requires_rollback(&self) -> bool {
        matches!(
            self,
            CoreError::QemuStart { .. }
                | CoreError::QemuCrashed { .. }
                | CoreError::SnapshotFailed { .. }
                | CoreError::NbdIo { .. }
                | CoreError::ClientUnreachable { .. }
                | CoreError::PortsExhausted { .. }
        )
    }
}
