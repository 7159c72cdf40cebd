//! Hub/client configuration (§2 [AMBIENT] Configuration): one `[hub]`
//! section plus one table per repository, loaded with `serde` + `toml`.
//!
//! The teacher parses its own bespoke section-config format
//! (`pbs-config`); that format is not itself a spec requirement, so we use
//! plain TOML tables instead, in the same "one file, named sections"
//! spirit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Error};
use serde::{Deserialize, Serialize};

use vbr_buildcfg::{CONFIG_DIR, DEFAULT_NBD_PORT_RANGE};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_port_range_start")]
    pub nbd_port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub nbd_port_range_end: u16,
    /// Unix account the SSH tunnel's remote end authenticates as.
    pub tunnel_user: String,
    /// Hostname or IP of the source-side node the tunnel connects to.
    pub tunnel_remote_host: String,
    #[serde(default = "default_tunnel_remote_port")]
    pub tunnel_remote_port: u16,
    #[serde(default = "default_qemu_nbd_binary")]
    pub qemu_nbd_binary: PathBuf,
    #[serde(default = "default_qemu_img_binary")]
    pub qemu_img_binary: PathBuf,
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: PathBuf,
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Base URL the source-side client uses to reach this hub for telemetry
    /// and completion callbacks (§4.6a reverse status channel); distinct
    /// from `listen_addr` since that's a bind address, not a client-facing
    /// one.
    #[serde(default = "default_external_url")]
    pub external_url: String,
    /// Local port the control channel forward lands on once the tunnel's
    /// reverse forward is up (§4.6); the control channel client connects
    /// to `127.0.0.1:{control_port}`.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
}

fn default_port_range_start() -> u16 {
    DEFAULT_NBD_PORT_RANGE.0
}
fn default_port_range_end() -> u16 {
    DEFAULT_NBD_PORT_RANGE.1
}
fn default_qemu_nbd_binary() -> PathBuf {
    PathBuf::from("/usr/bin/qemu-nbd")
}
fn default_qemu_img_binary() -> PathBuf {
    PathBuf::from("/usr/bin/qemu-img")
}
fn default_ssh_binary() -> PathBuf {
    PathBuf::from("/usr/bin/ssh")
}
fn default_catalog_path() -> PathBuf {
    PathBuf::from("/var/lib/vm-backup-hub/catalog.db")
}
fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}
fn default_control_port() -> u16 {
    8500
}
fn default_tunnel_remote_port() -> u16 {
    443
}
fn default_external_url() -> String {
    "https://127.0.0.1:8443".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySection {
    pub name: String,
    pub root_path: PathBuf,
    pub capacity_hint_bytes: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub hub: HubSection,
    #[serde(default)]
    pub repository: HashMap<String, RepositorySection>,
}

impl HubConfig {
    pub fn default_path() -> PathBuf {
        Path::new(CONFIG_DIR).join("hub.toml")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading hub config {}", path.display()))?;
        let config: HubConfig =
            toml::from_str(&raw).with_context(|| format!("parsing hub config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.hub.nbd_port_range_end < self.hub.nbd_port_range_start {
            bail!(
                "hub.nbd_port_range_end ({}) must be >= hub.nbd_port_range_start ({})",
                self.hub.nbd_port_range_end,
                self.hub.nbd_port_range_start
            );
        }
        if self.hub.tunnel_user.is_empty() {
            bail!("hub.tunnel_user must be set");
        }
        if self.hub.tunnel_remote_host.is_empty() {
            bail!("hub.tunnel_remote_host must be set");
        }
        for (id, repo) in &self.repository {
            if !repo.root_path.is_absolute() {
                bail!("repository.{id}.root_path must be absolute, got {:?}", repo.root_path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("hub.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir.path(),
            r#"
            [hub]
            tunnel_user = "vbackup"
            tunnel_remote_host = "source-node.example.com"
            "#,
        );
        let config = HubConfig::load(path).unwrap();
        assert_eq!(config.hub.nbd_port_range_start, DEFAULT_NBD_PORT_RANGE.0);
        assert_eq!(config.hub.nbd_port_range_end, DEFAULT_NBD_PORT_RANGE.1);
        assert!(config.repository.is_empty());
    }

    #[test]
    fn rejects_inverted_port_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir.path(),
            r#"
            [hub]
            tunnel_user = "vbackup"
            tunnel_remote_host = "source-node.example.com"
            nbd_port_range_start = 10200
            nbd_port_range_end = 10100
            "#,
        );
        assert!(HubConfig::load(path).is_err());
    }

    #[test]
    fn rejects_relative_repository_root_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir.path(),
            r#"
            [hub]
            tunnel_user = "vbackup"
            tunnel_remote_host = "source-node.example.com"

            [repository.repo1]
            name = "Primary"
            root_path = "relative/path"
            "#,
        );
        assert!(HubConfig::load(path).is_err());
    }

    #[test]
    fn parses_repository_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir.path(),
            r#"
            [hub]
            tunnel_user = "vbackup"
            tunnel_remote_host = "source-node.example.com"

            [repository.repo1]
            name = "Primary"
            root_path = "/var/lib/vm-backup-hub/repositories/primary"
            capacity_hint_bytes = 1099511627776
            "#,
        );
        let config = HubConfig::load(path).unwrap();
        let repo = config.repository.get("repo1").unwrap();
        assert_eq!(repo.name, "Primary");
        assert_eq!(repo.capacity_hint_bytes, Some(1_099_511_627_776));
        assert!(repo.enabled);
    }
}
