//! Compile-time paths used throughout the hub and the source-side client.

pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Directory holding the hub's TOML configuration.
pub const CONFIG_DIR: &str = "/etc/vm-backup-hub";

/// Directory holding per-job runtime state (PID files, control sockets).
#[macro_export]
macro_rules! RUN_DIR_M {
    () => {
        "/run/vm-backup-hub"
    };
}

/// Directory holding rotated logs for qemu-nbd children and the tunnel.
#[macro_export]
macro_rules! LOG_DIR_M {
    () => {
        "/var/log/vm-backup-hub"
    };
}

/// Default root under which per-VM QCOW2 repositories are laid out.
#[macro_export]
macro_rules! REPOSITORY_ROOT_M {
    () => {
        "/var/lib/vm-backup-hub/repositories"
    };
}

pub const RUN_DIR: &str = RUN_DIR_M!();
pub const LOG_DIR: &str = LOG_DIR_M!();
pub const REPOSITORY_ROOT: &str = REPOSITORY_ROOT_M!();

/// Unix user the hub daemon and its qemu-nbd children run as.
pub const BACKUP_USER_NAME: &str = "vbackup";
pub const BACKUP_GROUP_NAME: &str = "vbackup";

/// Default NBD port range (§4.2): 10100..=10200, 101 ports.
pub const DEFAULT_NBD_PORT_RANGE: (u16, u16) = (10100, 10200);

/// Minimum `qemu-nbd --shared` value; the source client opens a data and a
/// metadata connection per export, so anything less hangs the second one.
pub const QEMU_NBD_MIN_SHARED: u32 = 10;

/// Stall detector thresholds (§4.7): warn past this...
pub const TELEMETRY_WARN_AFTER_SECS: i64 = 60;
/// ...fail the job past this.
pub const TELEMETRY_STALL_AFTER_SECS: i64 = 300;

/// Stall detector polling cadence.
pub const STALL_DETECTOR_INTERVAL_SECS: u64 = 30;

/// qemu-nbd health-check cadence (§4.3).
pub const QEMU_NBD_MONITOR_INTERVAL_SECS: u64 = 30;

/// Graceful-shutdown window before escalating SIGTERM to SIGKILL.
pub const GRACEFUL_STOP_TIMEOUT_SECS: u64 = 5;

/// Cap on job-start child spawning (engine §5).
pub const JOB_START_TIMEOUT_SECS: u64 = 300;
