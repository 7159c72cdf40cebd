//! Payload carried over the SSH tunnel's control channel (§2, §4.6): the
//! single "start backup" request the hub sends to the source-side client,
//! naming every disk to back up under one VM-scoped invocation.
//!
//! This is the wire contract between `vbr-hub`'s control channel client
//! and `vbr-backup-client`'s control listener; it is deliberately the one
//! request the source client ever needs (§9: "single-snapshot multi-disk").

use serde::{Deserialize, Serialize};

use crate::job_id::JobId;
use crate::nbd_target::NbdTarget;
use crate::vm::CredentialRef;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartBackupTarget {
    pub disk_index: u32,
    pub disk_key: u32,
    pub nbd_target: NbdTarget,
    /// `None` for a full backup, or when no prior change-id is recorded.
    pub parent_change_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartBackupRequest {
    pub job_id: JobId,
    pub vm_context_id: String,
    pub vm_name: String,
    pub source_inventory_id: String,
    pub hypervisor_host: String,
    pub credential_ref: CredentialRef,
    /// Base URL the client pushes telemetry and completion reports to
    /// (§9: "the completion endpoint for backups lives under /backups/...").
    pub hub_url: String,
    pub targets: Vec<StartBackupTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartBackupAck {
    pub accepted: bool,
    pub message: Option<String>,
}
