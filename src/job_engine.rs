//! Backup Job Engine (§4.1): the VM-level transaction. Owns `StartBackup`,
//! `CompleteBackup`, `FailBackup`, `CancelBackup`, and the rollback
//! procedure that unwinds everything a failed start-up allocated.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};

use vbr_api_types::{
    BackupChain, BackupDisk, BackupJob, BackupPhase, BackupType, CompletionRequest, CoreError, DiskStatus,
    JobId, JobStatus, NbdTarget, StartBackupRequest, StartBackupTarget, VmContextId, VmDisk,
};
use vbr_catalog::Catalog;
use vbr_port_allocator::PortAllocator;
use vbr_qemu_nbd::QemuNbdManager;
use vbr_repository::RepositoryStore;

use crate::advisory_lock::AdvisoryLocks;
use crate::control_channel::ControlChannel;

fn catalog_err(e: anyhow::Error) -> CoreError {
    CoreError::Catalog { reason: e.to_string() }
}

pub struct JobEngine {
    pub catalog: Catalog,
    pub ports: Arc<PortAllocator>,
    pub qemu: Arc<QemuNbdManager>,
    pub repositories: HashMap<String, Arc<RepositoryStore>>,
    pub control_channel: Arc<dyn ControlChannel>,
    pub locks: Arc<AdvisoryLocks>,
    pub hub_url: String,
    /// `127.0.0.1:{control_port}`, the local end of the tunnel's control
    /// forward (§4.6).
    pub control_addr: String,
}

pub struct StartBackupOutcome {
    pub job: BackupJob,
    pub targets: Vec<NbdTarget>,
}

impl JobEngine {
    /// `StartBackup(vmContextId, type, repositoryId) -> BackupJob` (§4.1).
    pub async fn start_backup(
        &self,
        context_id: VmContextId,
        requested_type: BackupType,
        repository_id: String,
        force_full: bool,
    ) -> Result<StartBackupOutcome, CoreError> {
        let ctx = self
            .catalog
            .get_vm_context(context_id.clone())
            .await
            .map_err(catalog_err)?
            .ok_or_else(|| CoreError::NotFound { what: format!("vm context '{context_id}'") })?;

        if !ctx.state.accepts_backup() {
            return Err(CoreError::VmInFailover { vm_context_id: context_id.0 });
        }

        if self.catalog.has_running_job(context_id.clone()).await.map_err(catalog_err)? {
            return Err(CoreError::DuplicateBackup { vm_context_id: context_id.0 });
        }

        let repository = self
            .repositories
            .get(&repository_id)
            .ok_or_else(|| CoreError::NotFound { what: format!("repository '{repository_id}'") })?
            .clone();

        let disks = self.catalog.list_current_vm_disks(context_id.clone()).await.map_err(catalog_err)?;
        if disks.is_empty() {
            return Err(CoreError::NotFound { what: format!("disks for vm context '{context_id}'") });
        }

        let effective_type = if force_full { BackupType::Full } else { requested_type };

        // Preconditions for incremental: every disk needs a chain with a
        // recorded last change-id (§4.1). `force_full` bypasses this even
        // when a chain exists, which is why it's a caller-supplied flag
        // rather than inferred from chain presence (§9 Open Question).
        let mut chains: HashMap<u32, BackupChain> = HashMap::new();
        if effective_type == BackupType::Incremental {
            for disk in &disks {
                let chain = self.catalog.get_chain(context_id.clone(), disk.disk_key).await.map_err(catalog_err)?;
                match (chain, &disk.last_change_id) {
                    (Some(chain), Some(_)) => {
                        chains.insert(disk.disk_key, chain);
                    }
                    _ => {
                        return Err(CoreError::ChainMissing {
                            vm_context_id: context_id.0.clone(),
                            disk_index: disk.disk_key,
                        })
                    }
                }
            }
        }

        // Per-disk advisory locks, held through the whole start-up so two
        // concurrent `StartBackup` calls for the same VM can't race the
        // same live QCOW2 file (§5).
        let lock_keys = disks.iter().map(|d| (context_id.clone(), d.disk_key)).collect();
        let _guards = self.locks.lock_all(lock_keys).await;

        let job_id = JobId::generate();
        let now = Utc::now();
        let job = BackupJob {
            job_id: job_id.clone(),
            context_id: context_id.clone(),
            backup_type: effective_type,
            repository_id: repository_id.clone(),
            status: JobStatus::Running,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            bytes_transferred: 0,
            progress_percent: 0.0,
            phase: Some(BackupPhase::Snapshotting),
            speed_bps: 0.0,
            last_telemetry_at: Some(now),
            force_full,
        };

        // Job row created *first* (§7, §9: the historical bug created the
        // chain row before the job and violated the foreign key).
        self.catalog.create_job(job.clone()).await.map_err(catalog_err)?;

        match self.provision_disks(&job_id, &context_id, &ctx.vm_name, effective_type, &repository, &disks, &chains).await
        {
            Ok((backup_disks, targets)) => {
                let request = StartBackupRequest {
                    job_id: job_id.clone(),
                    vm_context_id: context_id.0.clone(),
                    vm_name: ctx.vm_name.clone(),
                    source_inventory_id: ctx.source_inventory_id.clone(),
                    hypervisor_host: ctx.hypervisor_host.clone(),
                    credential_ref: ctx.credential_ref.clone(),
                    hub_url: self.hub_url.clone(),
                    targets: backup_disks
                        .iter()
                        .zip(targets.iter())
                        .map(|(d, t)| StartBackupTarget {
                            disk_index: d.disk_index,
                            disk_key: d.disk_key,
                            nbd_target: t.clone(),
                            parent_change_id: d.parent_change_id.clone(),
                        })
                        .collect(),
                };

                if let Err(e) = self.control_channel.start_backup(&self.control_addr, request).await {
                    error!("job engine: job {job_id} could not reach source backup client: {e}");
                    self.rollback(&job_id).await;
                    return Err(e);
                }

                info!("job engine: job {job_id} started for VM '{}' ({} disks)", ctx.vm_name, targets.len());
                Ok(StartBackupOutcome { job, targets })
            }
            Err(e) => {
                error!("job engine: job {job_id} failed during start-up: {e}");
                self.rollback(&job_id).await;
                Err(e)
            }
        }
    }

    /// Creates the per-disk QCOW2 images, creates their `BackupDisk` rows,
    /// allocates ports, and starts qemu-nbd exports. On any failure the
    /// caller rolls back via `rollback`; this function only reports the
    /// error.
    async fn provision_disks(
        &self,
        job_id: &JobId,
        context_id: &VmContextId,
        vm_name: &str,
        backup_type: BackupType,
        repository: &Arc<RepositoryStore>,
        disks: &[VmDisk],
        chains: &HashMap<u32, BackupChain>,
    ) -> Result<(Vec<BackupDisk>, Vec<NbdTarget>), CoreError> {
        let mut backup_disks = Vec::with_capacity(disks.len());

        for (disk_index, disk) in disks.iter().enumerate() {
            let disk_index = disk_index as u32;
            let export_name = format!("disk{disk_index}");

            let (qcow2_path, backing_file, parent_change_id) = if backup_type == BackupType::Incremental {
                let chain = chains.get(&disk.disk_key).expect("checked in start_backup");
                let parent_job_id = chain.latest_job_id().clone();
                let parent_disk = self
                    .catalog
                    .list_backup_disks(parent_job_id.clone())
                    .await
                    .map_err(catalog_err)?
                    .into_iter()
                    .find(|d| d.disk_key == disk.disk_key)
                    .ok_or_else(|| CoreError::ChainMissing {
                        vm_context_id: context_id.0.clone(),
                        disk_index: disk.disk_key,
                    })?;
                let parent_path = std::path::PathBuf::from(&parent_disk.qcow2_path);
                let path = repository
                    .create_incremental(context_id.clone(), disk.disk_key, job_id.clone(), parent_path, disk.capacity_bytes)
                    .await
                    .map_err(|e| CoreError::RepositoryIo {
                        repository_id: repository.id().to_string(),
                        reason: e.to_string(),
                    })?;
                (path, Some(parent_disk.qcow2_path.clone()), disk.last_change_id.clone())
            } else {
                let path = repository
                    .create_full(context_id.clone(), disk.disk_key, job_id.clone(), disk.capacity_bytes)
                    .await
                    .map_err(|e| CoreError::RepositoryIo {
                        repository_id: repository.id().to_string(),
                        reason: e.to_string(),
                    })?;
                (path, None, None)
            };

            let backup_disk = BackupDisk {
                job_id: job_id.clone(),
                disk_key: disk.disk_key,
                disk_index,
                allocated_port: None,
                export_name,
                qcow2_path: qcow2_path.display().to_string(),
                backing_file,
                parent_change_id,
                new_change_id: None,
                bytes_transferred: 0,
                status: DiskStatus::Pending,
                progress_percent: 0.0,
            };
            self.catalog.create_backup_disk(backup_disk.clone()).await.map_err(catalog_err)?;
            backup_disks.push(backup_disk);
        }

        // Allocate one port per disk; the allocator itself rolls back
        // whatever it granted on the first exhaustion (§8 property 10).
        let granted = self.ports.allocate_for_job(job_id, vm_name, backup_disks.len() as u32, |i| {
            backup_disks[i as usize].export_name.clone()
        })?;

        let mut targets = Vec::with_capacity(backup_disks.len());
        for (disk_index, port) in &granted {
            let disk = &mut backup_disks[*disk_index as usize];
            disk.allocated_port = Some(*port);

            self.qemu
                .start(*port, &disk.export_name, std::path::Path::new(&disk.qcow2_path), job_id, *disk_index)
                .await?;

            self.catalog
                .apply_disk_telemetry(job_id.clone(), *disk_index, 0, DiskStatus::Transferring, 0.0)
                .await
                .map_err(catalog_err)?;

            targets.push(NbdTarget {
                disk_index: *disk_index,
                host: "127.0.0.1".to_string(),
                port: *port,
                export_name: disk.export_name.clone(),
            });
        }

        Ok((backup_disks, targets))
    }

    /// Reverse-order rollback (§4.1): stop started qemu-nbd children,
    /// release allocated ports, mark the job failed. The chain is never
    /// extended on a rollback path.
    async fn rollback(&self, job_id: &JobId) {
        self.qemu.stop_by_job_id(job_id).await;
        self.ports.release_by_job_id(job_id);
        if let Err(e) = self.catalog.finish_job_as(job_id.clone(), JobStatus::Failed, Utc::now()).await {
            error!("job engine: rollback for job {job_id} could not mark it failed: {e}");
        }
        if let Ok(Some(job)) = self.catalog.get_job(job_id.clone()).await {
            let _ = self.catalog.record_job_outcome(job.context_id, false).await;
        }
    }

    /// `CompleteBackup(jobId, perDiskResults)` (§4.1): idempotent per disk.
    pub async fn complete_backup(&self, job_id: JobId, completion: CompletionRequest) -> Result<(), CoreError> {
        let job = self
            .catalog
            .get_job(job_id.clone())
            .await
            .map_err(catalog_err)?
            .ok_or_else(|| CoreError::NotFound { what: format!("job '{job_id}'") })?;

        let backup_disks = self.catalog.list_backup_disks(job_id.clone()).await.map_err(catalog_err)?;
        let disk_key_by_index: HashMap<u32, u32> =
            backup_disks.iter().map(|d| (d.disk_index, d.disk_key)).collect();

        let mut any_failed = false;
        for result in &completion.per_disk {
            let Some(&disk_key) = disk_key_by_index.get(&result.disk_index) else {
                warn!("job engine: completion for job {job_id} references unknown disk index {}", result.disk_index);
                continue;
            };
            if result.success {
                let new_change_id = result.new_change_id.clone().unwrap_or_default();
                self.catalog
                    .complete_backup_disk(job_id.clone(), disk_key, new_change_id, result.bytes_transferred)
                    .await
                    .map_err(catalog_err)?;
            } else {
                any_failed = true;
                warn!(
                    "job engine: disk {} of job {job_id} reported failure: {}",
                    result.disk_index,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        // Release resources regardless of outcome (§8 property 2: a
        // terminal job holds no port/export references).
        self.qemu.stop_by_job_id(&job_id).await;
        self.ports.release_by_job_id(&job_id);

        if any_failed {
            self.catalog.finish_job_as(job_id.clone(), JobStatus::Failed, Utc::now()).await.map_err(catalog_err)?;
            let _ = self.catalog.record_job_outcome(job.context_id, false).await;
            return Ok(());
        }

        self.catalog.complete_job(job_id.clone(), Utc::now()).await.map_err(catalog_err)?;
        let _ = self.catalog.record_job_outcome(job.context_id.clone(), true).await;

        self.extend_chain(&job, &job_id).await;
        Ok(())
    }

    /// Appends the completed job to each of its disks' chains, creating a
    /// new chain per disk on a full backup.
    async fn extend_chain(&self, job: &BackupJob, job_id: &JobId) {
        let backup_disks = match self.catalog.list_backup_disks(job_id.clone()).await {
            Ok(disks) => disks,
            Err(e) => {
                error!("job engine: could not load disks to extend chain for job {job_id}: {e}");
                return;
            }
        };
        for disk in backup_disks {
            match job.backup_type {
                BackupType::Full => {
                    let chain_id = format!("chain-{}-{}", job.context_id.0, disk.disk_key);
                    if let Err(e) =
                        self.catalog.create_chain(chain_id, job.context_id.clone(), disk.disk_key, job_id.clone()).await
                    {
                        error!("job engine: could not create chain for disk {}: {e}", disk.disk_key);
                    }
                }
                BackupType::Incremental => {
                    if let Ok(Some(chain)) = self.catalog.get_chain(job.context_id.clone(), disk.disk_key).await {
                        if let Err(e) = self.catalog.append_chain_member(chain.chain_id, job_id.clone()).await {
                            error!("job engine: could not append chain member for disk {}: {e}", disk.disk_key);
                        }
                    }
                }
            }
        }
    }

    /// `FailBackup(jobId, reason)`: release resources, mark terminal. Reuses
    /// the rollback procedure's resource teardown.
    pub async fn fail_backup(&self, job_id: JobId, reason: &str) -> Result<(), CoreError> {
        warn!("job engine: failing job {job_id}: {reason}");
        self.rollback(&job_id).await;
        Ok(())
    }

    /// `CancelBackup(jobId)`: same teardown, different terminal status.
    pub async fn cancel_backup(&self, job_id: JobId) -> Result<(), CoreError> {
        self.qemu.stop_by_job_id(&job_id).await;
        self.ports.release_by_job_id(&job_id);
        self.catalog.finish_job_as(job_id.clone(), JobStatus::Cancelled, Utc::now()).await.map_err(catalog_err)?;
        if let Ok(Some(job)) = self.catalog.get_job(job_id).await {
            let _ = self.catalog.record_job_outcome(job.context_id, false).await;
        }
        Ok(())
    }
}
