//! Parsing for the `--nbd-targets` CLI flag (§6.3):
//! `disk0:nbd://HOST:PORT/EXPORT,disk1:nbd://HOST:PORT/EXPORT,...`
//!
//! The presence of this flag (over the legacy single-target
//! `--nbd-host`/`--nbd-port`) selects the single-snapshot, multi-disk path;
//! see §9's "single-snapshot multi-disk" design note.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbdTarget {
    pub disk_index: u32,
    pub host: String,
    pub port: u16,
    pub export_name: String,
}

impl fmt::Display for NbdTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "disk{}:nbd://{}:{}/{}",
            self.disk_index, self.host, self.port, self.export_name
        )
    }
}

impl FromStr for NbdTarget {
    type Err = Error;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let (disk_label, uri) = entry
            .split_once(':')
            .with_context(|| format!("nbd target '{entry}' missing 'disk<N>:' label"))?;
        let disk_index: u32 = disk_label
            .strip_prefix("disk")
            .with_context(|| format!("nbd target label '{disk_label}' must start with 'disk'"))?
            .parse()
            .with_context(|| format!("nbd target label '{disk_label}' has a non-numeric index"))?;

        let uri = uri
            .strip_prefix("nbd://")
            .with_context(|| format!("nbd target '{entry}' must use the nbd:// scheme"))?;
        let (host_port, export_name) = uri
            .split_once('/')
            .with_context(|| format!("nbd target '{entry}' missing '/EXPORT'"))?;
        let (host, port) = host_port
            .rsplit_once(':')
            .with_context(|| format!("nbd target '{entry}' missing ':PORT'"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("nbd target '{entry}' has a non-numeric port"))?;

        if export_name.is_empty() {
            bail!("nbd target '{entry}' has an empty export name");
        }

        Ok(NbdTarget {
            disk_index,
            host: host.to_string(),
            port,
            export_name: export_name.to_string(),
        })
    }
}

/// Parse the full comma-separated `--nbd-targets` value.
pub fn parse_nbd_targets(flag_value: &str) -> Result<Vec<NbdTarget>, Error> {
    flag_value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(NbdTarget::from_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_disk_list() {
        let targets =
            parse_nbd_targets("disk0:nbd://127.0.0.1:10100/disk0,disk1:nbd://127.0.0.1:10101/disk1")
                .unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].disk_index, 0);
        assert_eq!(targets[0].port, 10100);
        assert_eq!(targets[1].export_name, "disk1");
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_nbd_targets("disk0:127.0.0.1:10100/disk0").is_err());
        assert!(parse_nbd_targets("diskx:nbd://127.0.0.1:10100/disk0").is_err());
        assert!(parse_nbd_targets("disk0:nbd://127.0.0.1:10100/").is_err());
    }
}
