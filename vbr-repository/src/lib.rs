//! Backup Repository (§4.5): filesystem layout for QCOW2 full/incremental
//! chains. One directory per `(vm_context_id, disk_key)`; each incremental
//! carries a backing-file reference to its immediate predecessor.
//!
//! Grounded on `pbs-datastore::chunk_store::ChunkStore`: a `Mutex<()>`
//! serializes directory-mutating operations, paths are validated absolute
//! before use, and the store carries its own `name` for error messages.
//! `create_full`/`create_incremental` spawn `qemu-img` and block on its
//! exit status, so the public, async-facing entry points run that work
//! inside `tokio::task::spawn_blocking` -- the same discipline
//! `vbr-catalog`'s `with_conn` applies to blocking `rusqlite` calls -- to
//! keep a slow image creation from stalling other work scheduled on the
//! same runtime worker thread.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context as _, Error};
use log::info;
use serde::Serialize;

use vbr_api_types::{CoreError, JobId, Repository, VmContextId};

/// Opaque policy the core never interprets (§9 Open Question: retention).
#[derive(Debug, Clone, Serialize)]
pub struct PrunePolicy {
    pub keep_last: Option<u32>,
    pub keep_daily: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityReport {
    pub repository_id: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
}

pub struct RepositoryStore {
    repository: Repository,
    qemu_img_binary: PathBuf,
    mutex: Mutex<()>,
}

impl RepositoryStore {
    pub fn new(repository: Repository, qemu_img_binary: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = Path::new(&repository.root_path);
        if !root.is_absolute() {
            bail!(
                "repository '{}' root path must be absolute, got {:?}",
                repository.repository_id,
                root
            );
        }
        Ok(Self {
            repository,
            qemu_img_binary: qemu_img_binary.into(),
            mutex: Mutex::new(()),
        })
    }

    pub fn id(&self) -> &str {
        &self.repository.repository_id
    }

    fn disk_dir(&self, vm_context_id: &VmContextId, disk_key: u32) -> PathBuf {
        Path::new(&self.repository.root_path)
            .join(&vm_context_id.0)
            .join(disk_key.to_string())
    }

    fn job_qcow2_path(&self, vm_context_id: &VmContextId, disk_key: u32, job_id: &JobId) -> PathBuf {
        self.disk_dir(vm_context_id, disk_key)
            .join(format!("{job_id}.qcow2"))
    }

    /// `CreateFull(vmContextId, diskIndex, sizeBytes) -> path`. No backing
    /// file: the first element of a new chain. Runs on a blocking thread
    /// (see module docs); takes `self` in an `Arc` so the closure can own a
    /// clone of it for the `'static` bound `spawn_blocking` requires.
    pub async fn create_full(
        self: &Arc<Self>,
        vm_context_id: VmContextId,
        disk_key: u32,
        job_id: JobId,
        size_bytes: u64,
    ) -> Result<PathBuf, Error> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.create_full_blocking(&vm_context_id, disk_key, &job_id, size_bytes))
            .await
            .context("repository blocking task panicked")?
    }

    fn create_full_blocking(
        &self,
        vm_context_id: &VmContextId,
        disk_key: u32,
        job_id: &JobId,
        size_bytes: u64,
    ) -> Result<PathBuf, Error> {
        let _guard = self.mutex.lock().expect("repository lock poisoned");

        let dir = self.disk_dir(vm_context_id, disk_key);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating repository directory {}", dir.display()))?;

        let path = self.job_qcow2_path(vm_context_id, disk_key, job_id);
        if path.exists() {
            // idempotent under retry (§8): a prior attempt already created
            // this exact job's image, nothing to redo.
            return Ok(path);
        }

        self.run_qemu_img(&["create", "-f", "qcow2"], &path, size_bytes)?;
        info!(
            "repository '{}': created full image for {vm_context_id} disk {disk_key} at {}",
            self.repository.repository_id,
            path.display()
        );
        Ok(path)
    }

    /// `CreateIncremental(vmContextId, diskIndex, parentPath, sizeBytes) ->
    /// path`. Backing file set to `parent_path` (§4.5 invariant: MUST be
    /// on the same host-visible path). Runs on a blocking thread; see
    /// `create_full`.
    pub async fn create_incremental(
        self: &Arc<Self>,
        vm_context_id: VmContextId,
        disk_key: u32,
        job_id: JobId,
        parent_path: PathBuf,
        size_bytes: u64,
    ) -> Result<PathBuf, Error> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            this.create_incremental_blocking(&vm_context_id, disk_key, &job_id, &parent_path, size_bytes)
        })
        .await
        .context("repository blocking task panicked")?
    }

    fn create_incremental_blocking(
        &self,
        vm_context_id: &VmContextId,
        disk_key: u32,
        job_id: &JobId,
        parent_path: &Path,
        size_bytes: u64,
    ) -> Result<PathBuf, Error> {
        let _guard = self.mutex.lock().expect("repository lock poisoned");

        if !parent_path.exists() {
            bail!(
                "parent image {} for incremental of {vm_context_id} disk {disk_key} does not exist",
                parent_path.display()
            );
        }

        let dir = self.disk_dir(vm_context_id, disk_key);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating repository directory {}", dir.display()))?;

        let path = self.job_qcow2_path(vm_context_id, disk_key, job_id);
        if path.exists() {
            return Ok(path);
        }

        let backing_arg = format!("-obacking_file={},backing_fmt=qcow2", parent_path.display());
        self.run_qemu_img(&["create", "-f", "qcow2", &backing_arg], &path, size_bytes)?;
        info!(
            "repository '{}': created incremental for {vm_context_id} disk {disk_key} at {} (parent {})",
            self.repository.repository_id,
            path.display(),
            parent_path.display()
        );
        Ok(path)
    }

    fn run_qemu_img(&self, args: &[&str], path: &Path, size_bytes: u64) -> Result<(), Error> {
        let status = std::process::Command::new(&self.qemu_img_binary)
            .args(args)
            .arg(path)
            .arg(size_bytes.to_string())
            .status()
            .context("failed to spawn qemu-img")?;
        if !status.success() {
            bail!("qemu-img create exited with {status} for {}", path.display());
        }
        Ok(())
    }

    /// `Resolve(vmContextId, diskIndex, jobId) -> path`, for re-opening an
    /// already-created image (e.g. after a hub restart mid-job).
    pub fn resolve(
        &self,
        vm_context_id: &VmContextId,
        disk_key: u32,
        job_id: &JobId,
    ) -> Result<PathBuf, CoreError> {
        let path = self.job_qcow2_path(vm_context_id, disk_key, job_id);
        if !path.exists() {
            return Err(CoreError::ChainMissing {
                vm_context_id: vm_context_id.0.clone(),
                disk_index: disk_key,
            });
        }
        Ok(path)
    }

    /// `CapacityReport()`, backed by `statvfs` on the repository root.
    pub fn capacity_report(&self) -> Result<CapacityReport, Error> {
        let stat = nix::sys::statvfs::statvfs(Path::new(&self.repository.root_path))
            .context("statvfs on repository root failed")?;
        let block_size = stat.fragment_size().max(1) as u64;
        let total_bytes = stat.blocks() as u64 * block_size;
        let available_bytes = stat.blocks_available() as u64 * block_size;
        Ok(CapacityReport {
            repository_id: self.repository.repository_id.clone(),
            total_bytes,
            available_bytes,
            used_bytes: total_bytes.saturating_sub(available_bytes),
        })
    }

    /// Retention hook (§9 Open Question, resolved): the core never
    /// interprets `policy`; an external caller decides what "keep" means
    /// and this just removes chain members that are no longer referenced.
    /// No scheduler is implemented here.
    pub fn prune(&self, chain_disk_dir: &Path, keep_paths: &[PathBuf]) -> Result<Vec<PathBuf>, Error> {
        let _guard = self.mutex.lock().expect("repository lock poisoned");

        let mut removed = Vec::new();
        if !chain_disk_dir.exists() {
            return Ok(removed);
        }
        for entry in std::fs::read_dir(chain_disk_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("qcow2") {
                continue;
            }
            if keep_paths.iter().any(|p| p == &path) {
                continue;
            }
            std::fs::remove_file(&path)
                .with_context(|| format!("removing pruned image {}", path.display()))?;
            removed.push(path);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(dir: &Path) -> Repository {
        Repository {
            repository_id: "repo1".to_string(),
            name: "Primary".to_string(),
            root_path: dir.display().to_string(),
            capacity_hint_bytes: None,
            enabled: true,
        }
    }

    fn job() -> JobId {
        "job-20260101-000000.000-000001".parse().unwrap()
    }

    #[test]
    fn rejects_relative_root_path() {
        let repository = Repository {
            repository_id: "repo1".to_string(),
            name: "Primary".to_string(),
            root_path: "relative/path".to_string(),
            capacity_hint_bytes: None,
            enabled: true,
        };
        assert!(RepositoryStore::new(repository, "/usr/bin/qemu-img").is_err());
    }

    #[test]
    fn resolve_missing_image_returns_chain_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = RepositoryStore::new(repo(dir.path()), "/usr/bin/qemu-img").unwrap();
        let vm_id = VmContextId("vm-1".to_string());
        let err = store.resolve(&vm_id, 2000, &job()).unwrap_err();
        assert!(matches!(err, CoreError::ChainMissing { .. }));
    }

    #[test]
    fn disk_dir_layout_is_keyed_by_context_and_disk_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = RepositoryStore::new(repo(dir.path()), "/usr/bin/qemu-img").unwrap();
        let vm_id = VmContextId("vm-1".to_string());
        let expected = dir.path().join("vm-1").join("2000");
        assert_eq!(store.disk_dir(&vm_id, 2000), expected);
    }

    /// Stub `qemu-img` that just touches its output path, so the async
    /// `create_full`/`create_incremental` wrappers (and their `spawn_blocking`
    /// plumbing) can be exercised without a real qemu-img binary.
    fn write_stub_qemu_img(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let stub = dir.join("qemu-img-stub.sh");
        std::fs::write(
            &stub,
            "#!/bin/sh\nfor arg in \"$@\"; do\n  case \"$arg\" in\n    *.qcow2) touch \"$arg\" ;;\n  esac\ndone\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&stub).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&stub, perms).unwrap();
        stub
    }

    #[tokio::test]
    async fn create_full_runs_off_the_async_runtime_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub_qemu_img(dir.path());
        let root = dir.path().join("repo");
        let store = Arc::new(RepositoryStore::new(repo(&root), stub).unwrap());
        let vm_id = VmContextId("vm-1".to_string());

        let first = store.create_full(vm_id.clone(), 2000, job(), 10 * 1024 * 1024 * 1024).await.unwrap();
        assert!(first.exists());

        // idempotent under retry (§8): re-invoking for the same job must not
        // re-run qemu-img, just return the existing path.
        let second = store.create_full(vm_id, 2000, job(), 10 * 1024 * 1024 * 1024).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn create_incremental_sets_up_backing_chain() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub_qemu_img(dir.path());
        let root = dir.path().join("repo");
        let store = Arc::new(RepositoryStore::new(repo(&root), stub).unwrap());
        let vm_id = VmContextId("vm-1".to_string());

        let full_path = store.create_full(vm_id.clone(), 2000, job(), 10 * 1024 * 1024 * 1024).await.unwrap();

        let inc_job: JobId = "job-20260101-000000.000-000002".parse().unwrap();
        let inc_path = store
            .create_incremental(vm_id, 2000, inc_job, full_path.clone(), 10 * 1024 * 1024 * 1024)
            .await
            .unwrap();
        assert!(inc_path.exists());
        assert_ne!(inc_path, full_path);
    }
}
