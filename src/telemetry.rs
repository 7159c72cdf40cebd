//! Telemetry Receiver and Stall Detector (§4.4, §4.7).
//!
//! The receiver applies a pushed `TelemetryUpdate` to the catalog; the
//! detector is a background sweep over running jobs that turns a long
//! silence into a warning, then a failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, warn};
use tokio::time::sleep;

use vbr_api_types::{BackupJob, JobId, TelemetryUpdate};
use vbr_buildcfg::{STALL_DETECTOR_INTERVAL_SECS, TELEMETRY_STALL_AFTER_SECS, TELEMETRY_WARN_AFTER_SECS};
use vbr_catalog::Catalog;

use crate::job_engine::JobEngine;

/// `POST /telemetry/backup/{jobId}` (§6.1): apply a push update to the job
/// row and each of its disk rows, and bump `last_telemetry_at` so the stall
/// detector sees this job as alive.
pub async fn ingest(catalog: &Catalog, job_id: JobId, update: TelemetryUpdate) -> Result<(), anyhow::Error> {
    catalog
        .apply_telemetry(
            job_id.clone(),
            update.phase,
            update.bytes_transferred,
            update.progress_percent,
            update.speed_bps,
            update.timestamp,
        )
        .await?;

    for disk in &update.disks {
        catalog
            .apply_disk_telemetry(job_id.clone(), disk.index, disk.bytes, disk.status, disk.percent)
            .await?;
    }

    if let Some(reason) = &update.error {
        warn!("telemetry: job {job_id} reported an error: {reason}");
    }

    Ok(())
}

/// Background sweep (§4.7): every `STALL_DETECTOR_INTERVAL_SECS`, scan all
/// `running` jobs and compare `last_telemetry_at` against now. A job silent
/// past the warn threshold just logs; past the fail threshold, it is failed
/// through the full rollback path so its resources don't leak.
pub async fn run_stall_detector(engine: Arc<JobEngine>) {
    loop {
        sleep(Duration::from_secs(STALL_DETECTOR_INTERVAL_SECS)).await;

        let jobs = match engine.catalog.list_running_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("stall detector: could not list running jobs: {e}");
                continue;
            }
        };

        for job in jobs {
            check_job(&engine, &job).await;
        }
    }
}

async fn check_job(engine: &JobEngine, job: &BackupJob) {
    let Some(last) = job.last_telemetry_at else {
        return;
    };
    let elapsed = Utc::now().signed_duration_since(last).num_seconds();

    if elapsed >= TELEMETRY_STALL_AFTER_SECS {
        warn!(
            "stall detector: job {} has not reported telemetry for {elapsed}s (threshold {TELEMETRY_STALL_AFTER_SECS}s), failing it",
            job.job_id
        );
        if let Err(e) = engine.fail_backup(job.job_id.clone(), &stall_reason(elapsed)).await {
            error!("stall detector: could not fail stalled job {}: {e}", job.job_id);
        }
    } else if elapsed >= TELEMETRY_WARN_AFTER_SECS {
        warn!(
            "stall detector: job {} has not reported telemetry for {elapsed}s (warn threshold {TELEMETRY_WARN_AFTER_SECS}s)",
            job.job_id
        );
    }
}

/// Error text for a stalled job (§4.7, spec'd verbatim by the S5 acceptance
/// scenario): `"Job stalled — no telemetry for Xs"`.
fn stall_reason(elapsed: i64) -> String {
    format!("Job stalled — no telemetry for {elapsed}s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbr_api_types::{BackupPhase, BackupType, CredentialRef, JobStatus, Repository, VmContext, VmContextId, VmLifecycleState};
    use vbr_port_allocator::PortAllocator;
    use vbr_qemu_nbd::QemuNbdManager;

    async fn seeded_engine() -> (tempfile::TempDir, Arc<JobEngine>) {
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
                root_path: dir.path().join("repo").display().to_string(),
                capacity_hint_bytes: None,
                enabled: true,
            })
            .await
            .unwrap();

        let repo = Arc::new(
            vbr_repository::RepositoryStore::new(
                Repository {
                    repository_id: "repo1".to_string(),
                    name: "Primary".to_string(),
                    root_path: dir.path().join("repo").display().to_string(),
                    capacity_hint_bytes: None,
                    enabled: true,
                },
                "/usr/bin/qemu-img",
            )
            .unwrap(),
        );
        let mut repositories = std::collections::HashMap::new();
        repositories.insert("repo1".to_string(), repo);

        struct NoopControlChannel;
        #[async_trait::async_trait]
        impl crate::control_channel::ControlChannel for NoopControlChannel {
            async fn start_backup(
                &self,
                _control_addr: &str,
                _request: vbr_api_types::StartBackupRequest,
            ) -> Result<(), vbr_api_types::CoreError> {
                Ok(())
            }
        }

        let engine = Arc::new(JobEngine {
            catalog,
            ports: Arc::new(PortAllocator::new(10100, 10110)),
            qemu: Arc::new(QemuNbdManager::new("/usr/bin/qemu-nbd", dir.path().join("run"))),
            repositories,
            control_channel: Arc::new(NoopControlChannel),
            locks: Arc::new(crate::advisory_lock::AdvisoryLocks::new()),
            hub_url: "https://hub.example:8443".to_string(),
            control_addr: "127.0.0.1:8500".to_string(),
        });
        (dir, engine)
    }

    #[tokio::test]
    async fn stalled_job_past_fail_threshold_is_marked_failed() {
        let (_dir, engine) = seeded_engine().await;
        let context_id = VmContextId("vm-1".to_string());
        let job_id: JobId = "job-20260101-000000.000-000001".parse().unwrap();
        let stale_at = Utc::now() - chrono::Duration::seconds(TELEMETRY_STALL_AFTER_SECS + 10);

        engine
            .catalog
            .create_job(BackupJob {
                job_id: job_id.clone(),
                context_id,
                backup_type: BackupType::Full,
                repository_id: "repo1".to_string(),
                status: JobStatus::Running,
                created_at: stale_at,
                started_at: Some(stale_at),
                completed_at: None,
                bytes_transferred: 0,
                progress_percent: 0.0,
                phase: Some(BackupPhase::Transferring),
                speed_bps: 0.0,
                last_telemetry_at: Some(stale_at),
                force_full: false,
            })
            .await
            .unwrap();

        let job = engine.catalog.get_job(job_id.clone()).await.unwrap().unwrap();
        check_job(&engine, &job).await;

        let after = engine.catalog.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Failed);
    }

    #[test]
    fn stall_reason_matches_spec_text_verbatim() {
        assert_eq!(stall_reason(305), "Job stalled — no telemetry for 305s");
    }

    #[tokio::test]
    async fn fresh_job_is_left_alone() {
        let (_dir, engine) = seeded_engine().await;
        let context_id = VmContextId("vm-1".to_string());
        let job_id: JobId = "job-20260101-000000.000-000002".parse().unwrap();
        let now = Utc::now();

        engine
            .catalog
            .create_job(BackupJob {
                job_id: job_id.clone(),
                context_id,
                backup_type: BackupType::Full,
                repository_id: "repo1".to_string(),
                status: JobStatus::Running,
                created_at: now,
                started_at: Some(now),
                completed_at: None,
                bytes_transferred: 0,
                progress_percent: 0.0,
                phase: Some(BackupPhase::Transferring),
                speed_bps: 0.0,
                last_telemetry_at: Some(now),
                force_full: false,
            })
            .await
            .unwrap();

        let job = engine.catalog.get_job(job_id.clone()).await.unwrap().unwrap();
        check_job(&engine, &job).await;

        let after = engine.catalog.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Running);
    }
}
