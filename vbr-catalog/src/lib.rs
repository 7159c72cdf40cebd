//! Backup chain catalog (§3, §6.6): SQLite-backed persistence for VM
//! contexts, historical VM disks, backup jobs/disks, chains, repositories.
//!
//! Grounded on the `r2d2` + `spawn_blocking` pattern used throughout the
//! retrieval pack's backup-orchestrator example: a pooled synchronous
//! `rusqlite` connection is checked out and used inside
//! `tokio::task::spawn_blocking`, keeping the async runtime's worker
//! threads free of blocking file I/O.

mod schema;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Error};
use chrono::{DateTime, Utc};
use r2d2::CustomizeConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};

use vbr_api_types::{
    BackupChain, BackupDisk, BackupJob, BackupPhase, BackupType, CredentialRef, DiskStatus,
    JobId, JobStatus, Repository, VmContext, VmContextId, VmDisk, VmLifecycleState,
};

type Pool = r2d2::Pool<SqliteConnectionManager>;

#[derive(Debug)]
struct EnableForeignKeys;

impl CustomizeConnection<Connection, rusqlite::Error> for EnableForeignKeys {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
    }
}

#[derive(Clone)]
pub struct Catalog {
    pool: Arc<Pool>,
}

impl Catalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let manager = SqliteConnectionManager::file(path.as_ref());
        let pool = r2d2::Pool::builder()
            .connection_customizer(Box::new(EnableForeignKeys))
            .build(manager)
            .context("building sqlite connection pool")?;

        pool.get()?
            .execute_batch(schema::SCHEMA)
            .context("applying catalog schema")?;

        Ok(Self { pool: Arc::new(pool) })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&Connection) -> Result<T, Error> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context("checking out sqlite connection")?;
            f(&conn)
        })
        .await
        .context("catalog blocking task panicked")?
    }

    // -- VM contexts --

    pub async fn upsert_vm_context(&self, ctx: VmContext) -> Result<(), Error> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO vm_contexts
                    (context_id, vm_name, source_inventory_id, hypervisor_host, datacenter_path,
                     credential_ref, state, total_jobs, successful_jobs, failed_jobs, last_scheduled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(context_id) DO UPDATE SET
                    vm_name = excluded.vm_name,
                    hypervisor_host = excluded.hypervisor_host,
                    datacenter_path = excluded.datacenter_path,
                    credential_ref = excluded.credential_ref,
                    state = excluded.state,
                    last_scheduled_at = excluded.last_scheduled_at",
                params![
                    ctx.context_id.0,
                    ctx.vm_name,
                    ctx.source_inventory_id,
                    ctx.hypervisor_host,
                    ctx.datacenter_path,
                    ctx.credential_ref.0,
                    lifecycle_to_str(ctx.state),
                    ctx.total_jobs as i64,
                    ctx.successful_jobs as i64,
                    ctx.failed_jobs as i64,
                    ctx.last_scheduled_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_vm_context(&self, context_id: VmContextId) -> Result<Option<VmContext>, Error> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT context_id, vm_name, source_inventory_id, hypervisor_host, datacenter_path,
                        credential_ref, state, total_jobs, successful_jobs, failed_jobs, last_scheduled_at
                 FROM vm_contexts WHERE context_id = ?1",
                params![context_id.0],
                row_to_vm_context,
            )
            .optional()
            .map_err(Error::from)
        })
        .await
    }

    // -- VM disks (historical rows) --

    pub async fn record_vm_disk(&self, disk: VmDisk, recorded_at: DateTime<Utc>) -> Result<(), Error> {
        self.with_conn(move |conn| {
            if disk.is_current {
                conn.execute(
                    "UPDATE vm_disks SET is_current = 0
                     WHERE context_id = ?1 AND disk_key = ?2 AND is_current = 1",
                    params![disk.context_id.0, disk.disk_key],
                )?;
            }
            conn.execute(
                "INSERT INTO vm_disks
                    (context_id, disk_key, logical_index, capacity_bytes, provisioning_hint,
                     datastore, last_change_id, is_current, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    disk.context_id.0,
                    disk.disk_key,
                    disk.logical_index,
                    disk.capacity_bytes as i64,
                    disk.provisioning_hint,
                    disk.datastore,
                    disk.last_change_id,
                    disk.is_current as i64,
                    recorded_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// All disks currently marked live for `context_id`, ordered by logical
    /// index -- the shape `StartBackup` needs to build the per-disk target
    /// list (§4.1).
    pub async fn list_current_vm_disks(&self, context_id: VmContextId) -> Result<Vec<VmDisk>, Error> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT context_id, disk_key, logical_index, capacity_bytes, provisioning_hint,
                        datastore, last_change_id, is_current
                 FROM vm_disks WHERE context_id = ?1 AND is_current = 1 ORDER BY logical_index ASC",
            )?;
            let disks = stmt
                .query_map(params![context_id.0], row_to_vm_disk)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(disks)
        })
        .await
    }

    pub async fn find_context_by_vm_name(&self, vm_name: String) -> Result<Option<VmContext>, Error> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT context_id, vm_name, source_inventory_id, hypervisor_host, datacenter_path,
                        credential_ref, state, total_jobs, successful_jobs, failed_jobs, last_scheduled_at
                 FROM vm_contexts WHERE vm_name = ?1",
                params![vm_name],
                row_to_vm_context,
            )
            .optional()
            .map_err(Error::from)
        })
        .await
    }

    /// Bumps the VM's job counters (§3.1); called once a job reaches a
    /// terminal state.
    pub async fn record_job_outcome(&self, context_id: VmContextId, success: bool) -> Result<(), Error> {
        self.with_conn(move |conn| {
            if success {
                conn.execute(
                    "UPDATE vm_contexts SET total_jobs = total_jobs + 1, successful_jobs = successful_jobs + 1
                     WHERE context_id = ?1",
                    params![context_id.0],
                )?;
            } else {
                conn.execute(
                    "UPDATE vm_contexts SET total_jobs = total_jobs + 1, failed_jobs = failed_jobs + 1
                     WHERE context_id = ?1",
                    params![context_id.0],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn current_vm_disk(
        &self,
        context_id: VmContextId,
        disk_key: u32,
    ) -> Result<Option<VmDisk>, Error> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT context_id, disk_key, logical_index, capacity_bytes, provisioning_hint,
                        datastore, last_change_id, is_current
                 FROM vm_disks WHERE context_id = ?1 AND disk_key = ?2 AND is_current = 1",
                params![context_id.0, disk_key],
                row_to_vm_disk,
            )
            .optional()
            .map_err(Error::from)
        })
        .await
    }

    // -- repositories --

    pub async fn upsert_repository(&self, repo: Repository) -> Result<(), Error> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO repositories (repository_id, name, root_path, capacity_hint_bytes, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(repository_id) DO UPDATE SET
                    name = excluded.name, root_path = excluded.root_path,
                    capacity_hint_bytes = excluded.capacity_hint_bytes, enabled = excluded.enabled",
                params![
                    repo.repository_id,
                    repo.name,
                    repo.root_path,
                    repo.capacity_hint_bytes.map(|b| b as i64),
                    repo.enabled as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    // -- backup jobs --

    pub async fn create_job(&self, job: BackupJob) -> Result<(), Error> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO backup_jobs
                    (job_id, context_id, backup_type, repository_id, status, created_at,
                     started_at, completed_at, bytes_transferred, progress_percent, phase,
                     speed_bps, last_telemetry_at, force_full)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    job.job_id.as_str(),
                    job.context_id.0,
                    backup_type_to_str(job.backup_type),
                    job.repository_id,
                    job_status_to_str(job.status),
                    job.created_at.to_rfc3339(),
                    job.started_at.map(|t| t.to_rfc3339()),
                    job.completed_at.map(|t| t.to_rfc3339()),
                    job.bytes_transferred as i64,
                    job.progress_percent,
                    job.phase.map(phase_to_str),
                    job.speed_bps,
                    job.last_telemetry_at.map(|t| t.to_rfc3339()),
                    job.force_full as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_job_running(&self, job_id: JobId, started_at: DateTime<Utc>) -> Result<(), Error> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE backup_jobs SET status = ?1, started_at = ?2 WHERE job_id = ?3",
                params![job_status_to_str(JobStatus::Running), started_at.to_rfc3339(), job_id.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn apply_telemetry(
        &self,
        job_id: JobId,
        phase: BackupPhase,
        bytes_transferred: u64,
        progress_percent: f64,
        speed_bps: f64,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE backup_jobs SET phase = ?1, bytes_transferred = ?2, progress_percent = ?3,
                    speed_bps = ?4, last_telemetry_at = ?5
                 WHERE job_id = ?6 AND status = ?7",
                params![
                    phase_to_str(phase),
                    bytes_transferred as i64,
                    progress_percent,
                    speed_bps,
                    at.to_rfc3339(),
                    job_id.as_str(),
                    job_status_to_str(JobStatus::Running),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Marks the job (and every not-yet-completed disk) `failed` or
    /// `cancelled`. §8 property 2: a terminal job holds no port/export
    /// references, which the Job Engine enforces by releasing those
    /// *before* calling this.
    pub async fn finish_job_as(
        &self,
        job_id: JobId,
        status: JobStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        if status == JobStatus::Completed {
            anyhow::bail!("use complete_job for the success path");
        }
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE backup_jobs SET status = ?1, completed_at = ?2 WHERE job_id = ?3",
                params![job_status_to_str(status), completed_at.to_rfc3339(), job_id.as_str()],
            )?;
            tx.execute(
                "UPDATE backup_disks SET status = ?1
                 WHERE job_id = ?2 AND status NOT IN (?3)",
                params![disk_status_to_str(DiskStatus::Failed), job_id.as_str(), disk_status_to_str(DiskStatus::Completed)],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// `CompleteBackup`: only valid once every `BackupDisk` row for this
    /// job is `completed` with a non-null new change-id (§8 property 1).
    pub async fn complete_job(&self, job_id: JobId, completed_at: DateTime<Utc>) -> Result<(), Error> {
        self.with_conn(move |conn| {
            let (disk_count, incomplete): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), SUM(CASE WHEN status != ?1 OR new_change_id IS NULL THEN 1 ELSE 0 END)
                 FROM backup_disks WHERE job_id = ?2",
                params![disk_status_to_str(DiskStatus::Completed), job_id.as_str()],
                |row| Ok((row.get(0)?, row.get::<_, Option<i64>>(1)?.unwrap_or(0))),
            )?;
            if disk_count == 0 || incomplete > 0 {
                anyhow::bail!(
                    "job {job_id} cannot complete: {incomplete} of {disk_count} disks not yet completed"
                );
            }

            let total_bytes: i64 = conn.query_row(
                "SELECT COALESCE(SUM(bytes_transferred), 0) FROM backup_disks WHERE job_id = ?1",
                params![job_id.as_str()],
                |row| row.get(0),
            )?;

            conn.execute(
                "UPDATE backup_jobs SET status = ?1, completed_at = ?2, bytes_transferred = ?3,
                    progress_percent = 100.0
                 WHERE job_id = ?4",
                params![
                    job_status_to_str(JobStatus::Completed),
                    completed_at.to_rfc3339(),
                    total_bytes,
                    job_id.as_str(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<BackupJob>, Error> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT job_id, context_id, backup_type, repository_id, status, created_at,
                        started_at, completed_at, bytes_transferred, progress_percent, phase,
                        speed_bps, last_telemetry_at, force_full
                 FROM backup_jobs WHERE job_id = ?1",
                params![job_id.as_str()],
                row_to_backup_job,
            )
            .optional()
            .map_err(Error::from)
        })
        .await
    }

    /// Any job for `context_id` still in `running` blocks a new one
    /// (§8 invariant backing `ErrDuplicateBackup`).
    pub async fn has_running_job(&self, context_id: VmContextId) -> Result<bool, Error> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM backup_jobs WHERE context_id = ?1 AND status = ?2",
                params![context_id.0, job_status_to_str(JobStatus::Running)],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    /// Every `running` job, for the stall detector's 30s sweep (§4.7). The
    /// detector reads `(status, last_telemetry_at)` as one atomic snapshot
    /// per job by going through this single query rather than polling
    /// fields separately.
    pub async fn list_running_jobs(&self) -> Result<Vec<BackupJob>, Error> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT job_id, context_id, backup_type, repository_id, status, created_at,
                        started_at, completed_at, bytes_transferred, progress_percent, phase,
                        speed_bps, last_telemetry_at, force_full
                 FROM backup_jobs WHERE status = ?1",
            )?;
            let jobs = stmt
                .query_map(params![job_status_to_str(JobStatus::Running)], row_to_backup_job)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
        .await
    }

    /// Filterable listing for `GET /backups` (§6.1).
    pub async fn list_jobs(
        &self,
        context_id: Option<VmContextId>,
        status: Option<JobStatus>,
    ) -> Result<Vec<BackupJob>, Error> {
        self.with_conn(move |conn| {
            let mut sql = "SELECT job_id, context_id, backup_type, repository_id, status, created_at,
                        started_at, completed_at, bytes_transferred, progress_percent, phase,
                        speed_bps, last_telemetry_at, force_full
                 FROM backup_jobs WHERE 1=1"
                .to_string();
            if context_id.is_some() {
                sql.push_str(" AND context_id = ?1");
            }
            if status.is_some() {
                sql.push_str(if context_id.is_some() { " AND status = ?2" } else { " AND status = ?1" });
            }
            sql.push_str(" ORDER BY created_at DESC");

            let mut stmt = conn.prepare(&sql)?;
            let jobs = match (context_id, status) {
                (Some(c), Some(s)) => stmt
                    .query_map(params![c.0, job_status_to_str(s)], row_to_backup_job)?
                    .collect::<Result<Vec<_>, _>>()?,
                (Some(c), None) => stmt
                    .query_map(params![c.0], row_to_backup_job)?
                    .collect::<Result<Vec<_>, _>>()?,
                (None, Some(s)) => stmt
                    .query_map(params![job_status_to_str(s)], row_to_backup_job)?
                    .collect::<Result<Vec<_>, _>>()?,
                (None, None) => stmt
                    .query_map(params![], row_to_backup_job)?
                    .collect::<Result<Vec<_>, _>>()?,
            };
            Ok(jobs)
        })
        .await
    }

    /// Delete a job row, chain-aware (§6.1: "Delete (and cascade chain-
    /// aware)"): deleting a chain's full backup is only allowed once it has
    /// no incremental descendants left; deleting an incremental just drops
    /// its chain membership. `ON DELETE CASCADE` on `backup_disks` handles
    /// the per-disk rows.
    pub async fn delete_job(&self, job_id: JobId) -> Result<(), Error> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;

            let as_full: Option<(String, i64)> = tx
                .query_row(
                    "SELECT chain_id, (SELECT COUNT(*) FROM backup_chain_members WHERE chain_id = bc.chain_id)
                     FROM backup_chains bc WHERE bc.full_backup_id = ?1",
                    params![job_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((chain_id, member_count)) = as_full {
                if member_count > 0 {
                    anyhow::bail!(
                        "cannot delete job {job_id}: it is the full backup of chain '{chain_id}' with {member_count} incremental(s) still present"
                    );
                }
                tx.execute("DELETE FROM backup_chains WHERE chain_id = ?1", params![chain_id])?;
            } else {
                tx.execute(
                    "DELETE FROM backup_chain_members WHERE job_id = ?1",
                    params![job_id.as_str()],
                )?;
            }

            tx.execute("DELETE FROM backup_jobs WHERE job_id = ?1", params![job_id.as_str()])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // -- backup disks --

    pub async fn create_backup_disk(&self, disk: BackupDisk) -> Result<(), Error> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO backup_disks
                    (job_id, disk_key, disk_index, allocated_port, export_name, qcow2_path,
                     backing_file, parent_change_id, new_change_id, bytes_transferred, status,
                     progress_percent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    disk.job_id.as_str(),
                    disk.disk_key,
                    disk.disk_index,
                    disk.allocated_port,
                    disk.export_name,
                    disk.qcow2_path,
                    disk.backing_file,
                    disk.parent_change_id,
                    disk.new_change_id,
                    disk.bytes_transferred as i64,
                    disk_status_to_str(disk.status),
                    disk.progress_percent,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Idempotent completion (§8 property 7): completing the same
    /// `(job_id, disk_key)` twice with the same result leaves bytes and
    /// state unchanged rather than double-counting.
    pub async fn complete_backup_disk(
        &self,
        job_id: JobId,
        disk_key: u32,
        new_change_id: String,
        bytes_transferred: u64,
    ) -> Result<(), Error> {
        self.with_conn(move |conn| {
            let already: Option<String> = conn
                .query_row(
                    "SELECT new_change_id FROM backup_disks
                     WHERE job_id = ?1 AND disk_key = ?2 AND status = ?3",
                    params![job_id.as_str(), disk_key, disk_status_to_str(DiskStatus::Completed)],
                    |row| row.get(0),
                )
                .optional()?;
            if already.is_some() {
                return Ok(());
            }

            conn.execute(
                "UPDATE backup_disks SET status = ?1, new_change_id = ?2, bytes_transferred = ?3,
                    progress_percent = 100.0
                 WHERE job_id = ?4 AND disk_key = ?5",
                params![
                    disk_status_to_str(DiskStatus::Completed),
                    new_change_id,
                    bytes_transferred as i64,
                    job_id.as_str(),
                    disk_key,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// All per-disk rows for a job, ordered by disk index -- used to map
    /// a completion/telemetry payload's `disk_index` back to the
    /// hypervisor `disk_key` that chain lookups are actually keyed on
    /// (§9: keyed disk correlation).
    pub async fn list_backup_disks(&self, job_id: JobId) -> Result<Vec<BackupDisk>, Error> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT job_id, disk_key, disk_index, allocated_port, export_name, qcow2_path,
                        backing_file, parent_change_id, new_change_id, bytes_transferred, status,
                        progress_percent
                 FROM backup_disks WHERE job_id = ?1 ORDER BY disk_index ASC",
            )?;
            let disks = stmt
                .query_map(params![job_id.as_str()], row_to_backup_disk)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(disks)
        })
        .await
    }

    /// Applies per-disk telemetry bytes/status/percent in one go, then
    /// mirrors the sum onto the job row (§4.7: "completion used to ignore
    /// this and left the job field at 0" -- the historical bug this fixes).
    pub async fn apply_disk_telemetry(
        &self,
        job_id: JobId,
        disk_index: u32,
        bytes: u64,
        status: DiskStatus,
        percent: f64,
    ) -> Result<(), Error> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE backup_disks SET bytes_transferred = ?1, status = ?2, progress_percent = ?3
                 WHERE job_id = ?4 AND disk_index = ?5",
                params![bytes as i64, disk_status_to_str(status), percent, job_id.as_str(), disk_index],
            )?;
            let total_bytes: i64 = tx.query_row(
                "SELECT COALESCE(SUM(bytes_transferred), 0) FROM backup_disks WHERE job_id = ?1",
                params![job_id.as_str()],
                |row| row.get(0),
            )?;
            tx.execute(
                "UPDATE backup_jobs SET bytes_transferred = ?1 WHERE job_id = ?2 AND status = ?3",
                params![total_bytes, job_id.as_str(), job_status_to_str(JobStatus::Running)],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // -- backup chains --

    pub async fn get_chain(
        &self,
        context_id: VmContextId,
        disk_key: u32,
    ) -> Result<Option<BackupChain>, Error> {
        self.with_conn(move |conn| {
            let chain = conn
                .query_row(
                    "SELECT chain_id, context_id, disk_key, full_backup_id
                     FROM backup_chains WHERE context_id = ?1 AND disk_key = ?2",
                    params![context_id.0, disk_key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, u32>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;
            let Some((chain_id, context_id, disk_key, full_backup_id)) = chain else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT job_id FROM backup_chain_members WHERE chain_id = ?1 ORDER BY position ASC",
            )?;
            let members = stmt
                .query_map(params![chain_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Some(BackupChain {
                chain_id,
                context_id: VmContextId(context_id),
                disk_key,
                full_backup_id: parse_job_id(&full_backup_id)?,
                incremental_backup_ids: members
                    .iter()
                    .map(|s| parse_job_id(s))
                    .collect::<Result<Vec<_>, _>>()?,
            }))
        })
        .await
    }

    pub async fn create_chain(
        &self,
        chain_id: String,
        context_id: VmContextId,
        disk_key: u32,
        full_backup_id: JobId,
    ) -> Result<(), Error> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO backup_chains (chain_id, context_id, disk_key, full_backup_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![chain_id, context_id.0, disk_key, full_backup_id.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn append_chain_member(&self, chain_id: String, job_id: JobId) -> Result<(), Error> {
        self.with_conn(move |conn| {
            let next_position: i64 = conn.query_row(
                "SELECT COALESCE(MAX(position), -1) + 1 FROM backup_chain_members WHERE chain_id = ?1",
                params![chain_id],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO backup_chain_members (chain_id, position, job_id) VALUES (?1, ?2, ?3)",
                params![chain_id, next_position, job_id.as_str()],
            )?;
            Ok(())
        })
        .await
    }
}

fn parse_job_id(s: &str) -> Result<JobId, Error> {
    s.parse()
}

fn lifecycle_to_str(s: VmLifecycleState) -> &'static str {
    match s {
        VmLifecycleState::Discovered => "discovered",
        VmLifecycleState::Replicating => "replicating",
        VmLifecycleState::BackingUp => "backing_up",
        VmLifecycleState::Ready => "ready",
        VmLifecycleState::Failover => "failover",
    }
}

fn lifecycle_from_str(s: &str) -> Result<VmLifecycleState, rusqlite::Error> {
    Ok(match s {
        "discovered" => VmLifecycleState::Discovered,
        "replicating" => VmLifecycleState::Replicating,
        "backing_up" => VmLifecycleState::BackingUp,
        "ready" => VmLifecycleState::Ready,
        "failover" => VmLifecycleState::Failover,
        other => {
            return Err(rusqlite::Error::InvalidColumnType(
                0,
                format!("unknown vm lifecycle state '{other}'"),
                rusqlite::types::Type::Text,
            ))
        }
    })
}

fn backup_type_to_str(t: BackupType) -> &'static str {
    match t {
        BackupType::Full => "full",
        BackupType::Incremental => "incremental",
    }
}

fn backup_type_from_str(s: &str) -> Result<BackupType, rusqlite::Error> {
    Ok(match s {
        "full" => BackupType::Full,
        "incremental" => BackupType::Incremental,
        other => {
            return Err(rusqlite::Error::InvalidColumnType(
                0,
                format!("unknown backup type '{other}'"),
                rusqlite::types::Type::Text,
            ))
        }
    })
}

fn job_status_to_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn job_status_from_str(s: &str) -> Result<JobStatus, rusqlite::Error> {
    Ok(match s {
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        other => {
            return Err(rusqlite::Error::InvalidColumnType(
                0,
                format!("unknown job status '{other}'"),
                rusqlite::types::Type::Text,
            ))
        }
    })
}

fn disk_status_to_str(s: DiskStatus) -> &'static str {
    match s {
        DiskStatus::Pending => "pending",
        DiskStatus::Snapshotting => "snapshotting",
        DiskStatus::Transferring => "transferring",
        DiskStatus::Completed => "completed",
        DiskStatus::Failed => "failed",
    }
}

fn disk_status_from_str(s: &str) -> Result<DiskStatus, rusqlite::Error> {
    Ok(match s {
        "pending" => DiskStatus::Pending,
        "snapshotting" => DiskStatus::Snapshotting,
        "transferring" => DiskStatus::Transferring,
        "completed" => DiskStatus::Completed,
        "failed" => DiskStatus::Failed,
        other => {
            return Err(rusqlite::Error::InvalidColumnType(
                0,
                format!("unknown disk status '{other}'"),
                rusqlite::types::Type::Text,
            ))
        }
    })
}

fn phase_to_str(p: BackupPhase) -> &'static str {
    match p {
        BackupPhase::Snapshotting => "snapshotting",
        BackupPhase::Transferring => "transferring",
        BackupPhase::Finalizing => "finalizing",
    }
}

fn phase_from_str(s: &str) -> Result<BackupPhase, rusqlite::Error> {
    Ok(match s {
        "snapshotting" => BackupPhase::Snapshotting,
        "transferring" => BackupPhase::Transferring,
        "finalizing" => BackupPhase::Finalizing,
        other => {
            return Err(rusqlite::Error::InvalidColumnType(
                0,
                format!("unknown backup phase '{other}'"),
                rusqlite::types::Type::Text,
            ))
        }
    })
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::InvalidColumnType(0, format!("bad timestamp '{s}': {e}"), rusqlite::types::Type::Text)
        })
}

fn row_to_vm_context(row: &rusqlite::Row) -> rusqlite::Result<VmContext> {
    Ok(VmContext {
        context_id: VmContextId(row.get(0)?),
        vm_name: row.get(1)?,
        source_inventory_id: row.get(2)?,
        hypervisor_host: row.get(3)?,
        datacenter_path: row.get(4)?,
        credential_ref: CredentialRef(row.get(5)?),
        state: lifecycle_from_str(&row.get::<_, String>(6)?)?,
        total_jobs: row.get::<_, i64>(7)? as u64,
        successful_jobs: row.get::<_, i64>(8)? as u64,
        failed_jobs: row.get::<_, i64>(9)? as u64,
        last_scheduled_at: row
            .get::<_, Option<String>>(10)?
            .map(|s| parse_rfc3339(&s))
            .transpose()?,
    })
}

fn row_to_vm_disk(row: &rusqlite::Row) -> rusqlite::Result<VmDisk> {
    Ok(VmDisk {
        context_id: VmContextId(row.get(0)?),
        disk_key: row.get(1)?,
        logical_index: row.get(2)?,
        capacity_bytes: row.get::<_, i64>(3)? as u64,
        provisioning_hint: row.get(4)?,
        datastore: row.get(5)?,
        last_change_id: row.get(6)?,
        is_current: row.get::<_, i64>(7)? != 0,
    })
}

fn row_to_backup_job(row: &rusqlite::Row) -> rusqlite::Result<BackupJob> {
    Ok(BackupJob {
        job_id: row
            .get::<_, String>(0)?
            .parse()
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, format!("{e}"), rusqlite::types::Type::Text))?,
        context_id: VmContextId(row.get(1)?),
        backup_type: backup_type_from_str(&row.get::<_, String>(2)?)?,
        repository_id: row.get(3)?,
        status: job_status_from_str(&row.get::<_, String>(4)?)?,
        created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
        started_at: row.get::<_, Option<String>>(6)?.map(|s| parse_rfc3339(&s)).transpose()?,
        completed_at: row.get::<_, Option<String>>(7)?.map(|s| parse_rfc3339(&s)).transpose()?,
        bytes_transferred: row.get::<_, i64>(8)? as u64,
        progress_percent: row.get(9)?,
        phase: row.get::<_, Option<String>>(10)?.map(|s| phase_from_str(&s)).transpose()?,
        speed_bps: row.get(11)?,
        last_telemetry_at: row.get::<_, Option<String>>(12)?.map(|s| parse_rfc3339(&s)).transpose()?,
        force_full: row.get::<_, i64>(13)? != 0,
    })
}

fn row_to_backup_disk(row: &rusqlite::Row) -> rusqlite::Result<BackupDisk> {
    Ok(BackupDisk {
        job_id: row
            .get::<_, String>(0)?
            .parse()
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, format!("{e}"), rusqlite::types::Type::Text))?,
        disk_key: row.get(1)?,
        disk_index: row.get(2)?,
        allocated_port: row.get::<_, Option<i64>>(3)?.map(|p| p as u16),
        export_name: row.get(4)?,
        qcow2_path: row.get(5)?,
        backing_file: row.get(6)?,
        parent_change_id: row.get(7)?,
        new_change_id: row.get(8)?,
        bytes_transferred: row.get::<_, i64>(9)? as u64,
        status: disk_status_from_str(&row.get::<_, String>(10)?)?,
        progress_percent: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(suffix: &str) -> JobId {
        format!("job-20260101-000000.000-{suffix}").parse().unwrap()
    }

    async fn seeded_catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("catalog.db")).unwrap();
        catalog
            .upsert_vm_context(VmContext {
                context_id: VmContextId("vm-1".to_string()),
                vm_name: "alpha".to_string(),
                source_inventory_id: "vm-101".to_string(),
                hypervisor_host: "esx1".to_string(),
                datacenter_path: "/dc1".to_string(),
                credential_ref: CredentialRef("cred-1".to_string()),
                state: VmLifecycleState::Ready,
                total_jobs: 0,
                successful_jobs: 0,
                failed_jobs: 0,
                last_scheduled_at: None,
            })
            .await
            .unwrap();
        catalog
            .upsert_repository(Repository {
                repository_id: "repo1".to_string(),
                name: "Primary".to_string(),
                root_path: "/var/lib/vm-backup-hub/repositories".to_string(),
                capacity_hint_bytes: None,
                enabled: true,
            })
            .await
            .unwrap();
        (dir, catalog)
    }

    #[tokio::test]
    async fn duplicate_running_job_is_detected() {
        let (_dir, catalog) = seeded_catalog().await;
        let context_id = VmContextId("vm-1".to_string());
        assert!(!catalog.has_running_job(context_id.clone()).await.unwrap());

        catalog
            .create_job(BackupJob {
                job_id: job("000001"),
                context_id: context_id.clone(),
                backup_type: BackupType::Full,
                repository_id: "repo1".to_string(),
                status: JobStatus::Running,
                created_at: Utc::now(),
                started_at: Some(Utc::now()),
                completed_at: None,
                bytes_transferred: 0,
                progress_percent: 0.0,
                phase: Some(BackupPhase::Snapshotting),
                speed_bps: 0.0,
                last_telemetry_at: None,
                force_full: false,
            })
            .await
            .unwrap();

        assert!(catalog.has_running_job(context_id).await.unwrap());
    }

    #[tokio::test]
    async fn completing_same_disk_twice_does_not_double_count_bytes() {
        let (_dir, catalog) = seeded_catalog().await;
        let context_id = VmContextId("vm-1".to_string());
        let job_id = job("000002");

        catalog
            .create_job(BackupJob {
                job_id: job_id.clone(),
                context_id: context_id.clone(),
                backup_type: BackupType::Full,
                repository_id: "repo1".to_string(),
                status: JobStatus::Running,
                created_at: Utc::now(),
                started_at: Some(Utc::now()),
                completed_at: None,
                bytes_transferred: 0,
                progress_percent: 0.0,
                phase: Some(BackupPhase::Transferring),
                speed_bps: 0.0,
                last_telemetry_at: None,
                force_full: false,
            })
            .await
            .unwrap();

        catalog
            .create_backup_disk(BackupDisk {
                job_id: job_id.clone(),
                disk_key: 2000,
                disk_index: 0,
                allocated_port: Some(10100),
                export_name: "disk0".to_string(),
                qcow2_path: "/repo/vm-1/2000/job.qcow2".to_string(),
                backing_file: None,
                parent_change_id: None,
                new_change_id: None,
                bytes_transferred: 0,
                status: DiskStatus::Transferring,
                progress_percent: 0.0,
            })
            .await
            .unwrap();

        catalog
            .complete_backup_disk(job_id.clone(), 2000, "change-1".to_string(), 5_000_000_000)
            .await
            .unwrap();
        catalog
            .complete_backup_disk(job_id.clone(), 2000, "change-1".to_string(), 5_000_000_000)
            .await
            .unwrap();

        catalog.complete_job(job_id.clone(), Utc::now()).await.unwrap();
        let completed = catalog.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(completed.bytes_transferred, 5_000_000_000);
        assert_eq!(completed.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn chain_round_trips_with_ordered_members() {
        let (_dir, catalog) = seeded_catalog().await;
        let context_id = VmContextId("vm-1".to_string());
        let full_id = job("000003");
        let inc_id = job("000004");

        catalog.create_chain("chain-1".to_string(), context_id.clone(), 2000, full_id.clone()).await.unwrap();
        catalog.append_chain_member("chain-1".to_string(), inc_id.clone()).await.unwrap();

        let chain = catalog.get_chain(context_id, 2000).await.unwrap().unwrap();
        assert_eq!(chain.full_backup_id, full_id);
        assert_eq!(chain.incremental_backup_ids, vec![inc_id.clone()]);
        assert_eq!(chain.latest_job_id(), &inc_id);
    }

    #[tokio::test]
    async fn deleting_a_full_backup_with_incrementals_is_rejected() {
        let (_dir, catalog) = seeded_catalog().await;
        let context_id = VmContextId("vm-1".to_string());
        let full_id = job("000005");
        let inc_id = job("000006");

        catalog.create_chain("chain-2".to_string(), context_id, 2000, full_id.clone()).await.unwrap();
        catalog.append_chain_member("chain-2".to_string(), inc_id).await.unwrap();

        let err = catalog.delete_job(full_id).await.unwrap_err();
        assert!(err.to_string().contains("incremental"));
    }

    #[tokio::test]
    async fn list_current_vm_disks_only_returns_live_rows() {
        let (_dir, catalog) = seeded_catalog().await;
        let context_id = VmContextId("vm-1".to_string());
        let now = Utc::now();

        catalog
            .record_vm_disk(
                VmDisk {
                    context_id: context_id.clone(),
                    disk_key: 2000,
                    logical_index: 0,
                    capacity_bytes: 42_949_672_960,
                    provisioning_hint: "thin".to_string(),
                    datastore: "ds1".to_string(),
                    last_change_id: None,
                    is_current: true,
                },
                now,
            )
            .await
            .unwrap();
        catalog
            .record_vm_disk(
                VmDisk {
                    context_id: context_id.clone(),
                    disk_key: 2000,
                    logical_index: 0,
                    capacity_bytes: 42_949_672_960,
                    provisioning_hint: "thin".to_string(),
                    datastore: "ds1".to_string(),
                    last_change_id: Some("change-x".to_string()),
                    is_current: true,
                },
                now + chrono::Duration::seconds(1),
            )
            .await
            .unwrap();

        let disks = catalog.list_current_vm_disks(context_id).await.unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].last_change_id.as_deref(), Some("change-x"));
    }

    #[tokio::test]
    async fn apply_disk_telemetry_mirrors_sum_onto_job_row() {
        let (_dir, catalog) = seeded_catalog().await;
        let context_id = VmContextId("vm-1".to_string());
        let job_id = job("000007");

        catalog
            .create_job(BackupJob {
                job_id: job_id.clone(),
                context_id,
                backup_type: BackupType::Full,
                repository_id: "repo1".to_string(),
                status: JobStatus::Running,
                created_at: Utc::now(),
                started_at: Some(Utc::now()),
                completed_at: None,
                bytes_transferred: 0,
                progress_percent: 0.0,
                phase: Some(BackupPhase::Transferring),
                speed_bps: 0.0,
                last_telemetry_at: None,
                force_full: false,
            })
            .await
            .unwrap();

        for (disk_index, disk_key) in [(0u32, 2000u32), (1, 2001)] {
            catalog
                .create_backup_disk(BackupDisk {
                    job_id: job_id.clone(),
                    disk_key,
                    disk_index,
                    allocated_port: Some(10100 + disk_index as u16),
                    export_name: format!("disk{disk_index}"),
                    qcow2_path: format!("/repo/vm-1/{disk_key}/job.qcow2"),
                    backing_file: None,
                    parent_change_id: None,
                    new_change_id: None,
                    bytes_transferred: 0,
                    status: DiskStatus::Transferring,
                    progress_percent: 0.0,
                })
                .await
                .unwrap();
        }

        catalog
            .apply_disk_telemetry(job_id.clone(), 0, 1_000, DiskStatus::Transferring, 10.0)
            .await
            .unwrap();
        catalog
            .apply_disk_telemetry(job_id.clone(), 1, 2_000, DiskStatus::Transferring, 40.0)
            .await
            .unwrap();

        let job_row = catalog.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job_row.bytes_transferred, 3_000);
    }
}
