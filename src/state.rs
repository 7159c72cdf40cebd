//! Shared hub state (§5): the catalog, the port pool, the qemu-nbd
//! manager, the tunnel, and the configured repositories, wired together
//! once at daemon startup and handed to the job engine, the REST layer,
//! and the stall detector as `Arc`s.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context as _, Error};

use vbr_catalog::Catalog;
use vbr_config::HubConfig;
use vbr_port_allocator::PortAllocator;
use vbr_qemu_nbd::QemuNbdManager;
use vbr_repository::RepositoryStore;
use vbr_tunnel::{TunnelConfig, TunnelManager};

use crate::advisory_lock::AdvisoryLocks;
use crate::control_channel::{ControlChannel, ReqwestControlChannel};
use crate::job_engine::JobEngine;

pub struct HubState {
    pub config: HubConfig,
    pub catalog: Catalog,
    pub ports: Arc<PortAllocator>,
    pub qemu: Arc<QemuNbdManager>,
    pub tunnel: Arc<TunnelManager>,
    pub repositories: HashMap<String, Arc<RepositoryStore>>,
    pub control_channel: Arc<dyn ControlChannel>,
    pub job_engine: Arc<JobEngine>,
}

impl HubState {
    pub async fn init(config: HubConfig) -> Result<Arc<Self>, Error> {
        let catalog = Catalog::open(&config.hub.catalog_path)
            .with_context(|| format!("opening catalog at {}", config.hub.catalog_path.display()))?;

        for (id, repo) in &config.repository {
            catalog
                .upsert_repository(vbr_api_types::Repository {
                    repository_id: id.clone(),
                    name: repo.name.clone(),
                    root_path: repo.root_path.display().to_string(),
                    capacity_hint_bytes: repo.capacity_hint_bytes,
                    enabled: repo.enabled,
                })
                .await
                .with_context(|| format!("registering repository '{id}'"))?;
        }

        let mut repositories = HashMap::new();
        for (id, repo) in &config.repository {
            let store = RepositoryStore::new(
                vbr_api_types::Repository {
                    repository_id: id.clone(),
                    name: repo.name.clone(),
                    root_path: repo.root_path.display().to_string(),
                    capacity_hint_bytes: repo.capacity_hint_bytes,
                    enabled: repo.enabled,
                },
                config.hub.qemu_img_binary.clone(),
            )
            .with_context(|| format!("initializing repository store '{id}'"))?;
            repositories.insert(id.clone(), Arc::new(store));
        }

        let ports = Arc::new(PortAllocator::new(
            config.hub.nbd_port_range_start,
            config.hub.nbd_port_range_end,
        ));
        let qemu = Arc::new(QemuNbdManager::new(
            config.hub.qemu_nbd_binary.clone(),
            vbr_buildcfg::RUN_DIR,
        ));
        let tunnel = Arc::new(TunnelManager::new(TunnelConfig {
            ssh_binary: config.hub.ssh_binary.clone(),
            control_path: std::path::PathBuf::from(vbr_buildcfg::RUN_DIR).join("tunnel.ctrl"),
            remote_user: config.hub.tunnel_user.clone(),
            remote_host: config.hub.tunnel_remote_host.clone(),
            remote_port: config.hub.tunnel_remote_port,
            identity_file: None,
        }));

        let control_channel: Arc<dyn ControlChannel> = Arc::new(ReqwestControlChannel::new());

        let job_engine = Arc::new(JobEngine {
            catalog: catalog.clone(),
            ports: ports.clone(),
            qemu: qemu.clone(),
            repositories: repositories.clone(),
            control_channel: control_channel.clone(),
            locks: Arc::new(AdvisoryLocks::new()),
            hub_url: config.hub.external_url.clone(),
            control_addr: format!("127.0.0.1:{}", config.hub.control_port),
        });

        Ok(Arc::new(Self {
            config,
            catalog,
            ports,
            qemu,
            tunnel,
            repositories,
            control_channel,
            job_engine,
        }))
    }
}
