//! Source-side Backup Client (§4.4): the one process that touches the
//! source hypervisor, invoked as a child over the SSH tunnel's control
//! channel.

pub mod control_listener;
pub mod hypervisor;
pub mod telemetry_push;
pub mod transfer;

pub use control_listener::{router as control_listener_router, ListenerConfig};
pub use hypervisor::{
    Credential, CredentialResolver, DiskExtent, EnvCredentialResolver, HypervisorConnector, HypervisorSession,
    SnapshotHandle, UnimplementedConnector,
};
pub use telemetry_push::TelemetryPusher;
pub use transfer::{run_backup, BackupOutcome};
