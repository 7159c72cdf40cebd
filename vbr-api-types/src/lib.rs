//! Shared data and wire types for the VM backup core.
//!
//! Every type here is plain `serde`-derived data: the REST layer, the
//! catalog, and the source-side client all speak these structs directly
//! rather than going through a schema-macro layer.

pub mod control;
pub mod error;
pub mod job_id;
pub mod nbd_target;
pub mod telemetry;
pub mod vm;

pub use control::{StartBackupAck, StartBackupRequest, StartBackupTarget};
pub use error::CoreError;
pub use job_id::JobId;
pub use nbd_target::{parse_nbd_targets, NbdTarget};
pub use telemetry::{
    CompletionRequest, DiskCompletionResult, DiskTelemetry, TelemetryCadence, TelemetryUpdate,
};
pub use vm::{
    BackupChain, BackupDisk, BackupJob, BackupPhase, BackupType, CredentialRef, DiskStatus,
    JobStatus, PortAllocation, QemuExport, QemuExportStatus, Repository, VmContext, VmContextId,
    VmDisk, VmLifecycleState,
};
