//! Hypervisor session seam.
//!
//! The concrete VMware vSphere session -- SOAP/REST auth, snapshot
//! creation, CBT queries -- is out of scope for this workspace: no
//! vSphere SDK crate is available to build it on, and credential
//! resolution is treated as an external concern the same way `CredentialRef`
//! is on the hub side (§3 Supplement). What must exist here is the seam a
//! production VMware backend plugs into, and a disk-reader abstraction
//! concrete enough to drive the rest of the client (extent iteration,
//! sparse detection, transfer) for real.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vbr_api_types::CredentialRef;

#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub secret: String,
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, reference: &CredentialRef) -> anyhow::Result<Credential>;
}

/// One contiguous run of a disk, as reported by CBT or by a full scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskExtent {
    pub offset: u64,
    pub length: u64,
    /// `false` when the source itself reports this range as sparse/unallocated
    /// (a thin-provisioned hole, or -- for CBT -- a changed range the
    /// hypervisor already knows reads as zero). The transfer loop skips the
    /// source read entirely for these and goes straight to `WRITE_ZEROES`
    /// (§4.4 step d, first bullet: "skips network entirely"), which is a
    /// distinct, cheaper fast path than the client-side all-zero check it
    /// still runs over the bytes of `allocated` extents.
    pub allocated: bool,
}

#[async_trait]
pub trait SnapshotHandle: Send + Sync {
    /// Current change-id for `disk_key` at this snapshot, to persist as
    /// the disk's `new_change_id` on completion.
    async fn current_change_id(&self, disk_key: u32) -> anyhow::Result<String>;

    /// Extents to copy for `disk_key`. When `parent_change_id` is `Some`,
    /// this MUST be the CBT-reported changed set; when `None` (full
    /// backup or CBT unavailable), the full allocated extent list.
    async fn extents(
        &self,
        disk_key: u32,
        parent_change_id: Option<&str>,
    ) -> anyhow::Result<Vec<DiskExtent>>;

    /// Read `length` bytes at `offset` from `disk_key` at the snapshot
    /// instant.
    async fn read(&self, disk_key: u32, offset: u64, length: u32) -> anyhow::Result<Vec<u8>>;

    /// Disk capacity, used to size the target QCOW2 (already created by
    /// the hub, but useful for sanity-checking extent bounds).
    async fn disk_capacity(&self, disk_key: u32) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait HypervisorSession: Send + Sync {
    /// One snapshot covering every disk in `disk_keys` (§4.4 step 2: "one
    /// snapshot per VM", never per-disk -- multi-disk consistency is a
    /// hard correctness contract, §9).
    async fn snapshot(
        &self,
        source_inventory_id: &str,
        disk_keys: &[u32],
    ) -> anyhow::Result<Box<dyn SnapshotHandle>>;

    /// Takes the handle by reference, not by value: the source client
    /// shares one handle across every disk's concurrent transfer task via
    /// `Arc`, so ownership can't be handed back at cleanup time.
    async fn remove_snapshot(&self, handle: &dyn SnapshotHandle) -> anyhow::Result<()>;
}

#[async_trait]
pub trait HypervisorConnector: Send + Sync {
    async fn connect(&self, hypervisor_host: &str, credential: Credential) -> anyhow::Result<Box<dyn HypervisorSession>>;
}

/// Resolves a `CredentialRef` from an environment variable named after it,
/// e.g. `CredentialRef("vcenter-prod")` reads `VBR_CREDENTIAL_VCENTER_PROD`
/// as `username:secret`. A real deployment would back this with a vault
/// client instead; the seam (`CredentialResolver`) is what matters here.
pub struct EnvCredentialResolver;

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(&self, reference: &CredentialRef) -> anyhow::Result<Credential> {
        let var_name = format!("VBR_CREDENTIAL_{}", reference.0.to_uppercase().replace('-', "_"));
        let raw = std::env::var(&var_name)
            .map_err(|_| anyhow::anyhow!("credential '{}' not found: ${var_name} is not set", reference.0))?;
        let (username, secret) = raw
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("${var_name} must be in 'username:secret' form"))?;
        Ok(Credential { username: username.to_string(), secret: secret.to_string() })
    }
}

/// Placeholder `HypervisorConnector` for builds without a real vSphere
/// backend wired in. Errors clearly instead of silently no-op'ing so a
/// misconfigured deployment fails loud at the first `StartBackup` rather
/// than producing an empty backup.
pub struct UnimplementedConnector;

#[async_trait]
impl HypervisorConnector for UnimplementedConnector {
    async fn connect(&self, hypervisor_host: &str, _credential: Credential) -> anyhow::Result<Box<dyn HypervisorSession>> {
        anyhow::bail!("no vSphere connector configured for this build (tried to reach '{hypervisor_host}')")
    }
}
