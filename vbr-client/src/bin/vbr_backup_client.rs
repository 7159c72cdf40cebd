//! Source backup client CLI (§6.3): invoked as a child over the tunnel's
//! control channel, one process per `StartBackup` call.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use vbr_api_types::{CompletionRequest, CredentialRef, JobId, NbdTarget};
use vbr_client::{run_backup, CredentialResolver, EnvCredentialResolver, TelemetryPusher, UnimplementedConnector};

/// Exit codes (§6.3a): 0 success, 1 generic/config error before any disk
/// started, 2 one or more disks failed (partial), 3 snapshot/hypervisor
/// session failure (no disk started).
const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_PARTIAL_FAILURE: u8 = 2;
const EXIT_SNAPSHOT_FAILURE: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "vbr-backup-client", about = "Source-side VMware backup client")]
struct Args {
    /// Legacy single-target host (default 127.0.0.1, through the local
    /// tunnel endpoint).
    #[arg(long, default_value = "127.0.0.1")]
    nbd_host: String,

    /// Legacy single-target port; mutually exclusive with `--nbd-targets`.
    #[arg(long)]
    nbd_port: Option<u16>,

    /// `disk0:nbd://HOST:PORT/EXPORT,disk1:...` (§6.3); presence selects
    /// the multi-disk, single-snapshot path.
    #[arg(long)]
    nbd_targets: Option<String>,

    /// Job id used for telemetry and completion calls.
    #[arg(long)]
    job_id: String,

    /// Base URL for telemetry/completion calls to the hub.
    #[arg(long)]
    hub_url: String,

    #[arg(long)]
    vm_context_id: String,

    #[arg(long)]
    hypervisor_host: String,

    #[arg(long)]
    source_inventory_id: String,

    #[arg(long)]
    credential_ref: String,

    /// Per-disk routing the hub already knows but the CLI still needs:
    /// `diskIndex:diskKey:parentChangeId` (parentChangeId `-` for none),
    /// comma-separated, in the same order as `--nbd-targets`.
    #[arg(long)]
    disk_map: String,
}

struct DiskRoute {
    disk_key: u32,
    parent_change_id: Option<String>,
}

fn parse_disk_map(raw: &str) -> anyhow::Result<HashMap<u32, DiskRoute>> {
    let mut map = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = entry.splitn(3, ':');
        let disk_index: u32 = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("disk-map entry '{entry}' missing disk index"))?
            .parse()?;
        let disk_key: u32 = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("disk-map entry '{entry}' missing disk key"))?
            .parse()?;
        let parent_change_id = match parts.next() {
            Some("-") | None => None,
            Some(other) => Some(other.to_string()),
        };
        map.insert(disk_index, DiskRoute { disk_key, parent_change_id });
    }
    Ok(map)
}

fn build_targets(args: &Args) -> anyhow::Result<Vec<NbdTarget>> {
    if let Some(targets) = &args.nbd_targets {
        return vbr_api_types::parse_nbd_targets(targets);
    }
    let port = args
        .nbd_port
        .ok_or_else(|| anyhow::anyhow!("one of --nbd-targets or --nbd-host/--nbd-port is required"))?;
    Ok(vec![NbdTarget { disk_index: 0, host: args.nbd_host.clone(), port, export_name: "disk0".to_string() }])
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("vbr-backup-client: {e}");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<u8> {
    let job_id: JobId = args.job_id.parse()?;
    let targets = build_targets(&args)?;
    let disk_routes = parse_disk_map(&args.disk_map)?;

    for target in &targets {
        if !disk_routes.contains_key(&target.disk_index) {
            anyhow::bail!("--disk-map has no entry for disk index {}", target.disk_index);
        }
    }

    let connector = UnimplementedConnector;
    let resolver = EnvCredentialResolver;
    let credential = resolver.resolve(&CredentialRef(args.credential_ref.clone())).await?;

    let connector: &dyn vbr_client::HypervisorConnector = &connector;
    let session = match connector.connect(&args.hypervisor_host, credential).await {
        Ok(session) => session,
        Err(e) => {
            error!("vbr-backup-client: could not open hypervisor session: {e}");
            return Ok(EXIT_SNAPSHOT_FAILURE);
        }
    };

    let disk_keys: Vec<u32> = targets.iter().map(|t| disk_routes[&t.disk_index].disk_key).collect();
    let snapshot: Arc<dyn vbr_client::SnapshotHandle> =
        match session.snapshot(&args.source_inventory_id, &disk_keys).await {
            Ok(handle) => Arc::from(handle),
            Err(e) => {
                error!("vbr-backup-client: snapshot failed for VM '{}': {e}", args.vm_context_id);
                return Ok(EXIT_SNAPSHOT_FAILURE);
            }
        };

    let pusher = Arc::new(TelemetryPusher::new(args.hub_url.clone(), job_id.clone(), targets.len() as u32));

    info!("vbr-backup-client: job {job_id} starting transfer of {} disk(s)", targets.len());

    let work: Vec<(u32, u32, NbdTarget, Option<String>)> = targets
        .into_iter()
        .map(|t| {
            let route = &disk_routes[&t.disk_index];
            (t.disk_index, route.disk_key, t, route.parent_change_id.clone())
        })
        .collect();

    let outcome = run_backup(snapshot.clone(), pusher.clone(), work).await;

    if !outcome.all_succeeded {
        pusher.report_error("one or more disks failed during transfer").await;
    }

    let completion = CompletionRequest { per_disk: outcome.per_disk };
    if let Err(e) = send_completion(&args.hub_url, &job_id, &completion).await {
        error!("vbr-backup-client: could not report completion to hub: {e}");
    }

    // Snapshot removal proceeds regardless of transfer outcome so a failed
    // disk doesn't leak a hypervisor snapshot; every transfer task has
    // finished by the time `run_backup` returns, so `snapshot` is only
    // referenced here.
    if let Err(e) = session.remove_snapshot(&*snapshot).await {
        error!("vbr-backup-client: could not remove snapshot: {e}");
    }

    Ok(if outcome.all_succeeded { EXIT_OK } else { EXIT_PARTIAL_FAILURE })
}

async fn send_completion(hub_url: &str, job_id: &JobId, completion: &CompletionRequest) -> anyhow::Result<()> {
    let url = format!("{}/backups/{job_id}/complete", hub_url.trim_end_matches('/'));
    let client = reqwest::Client::new();
    let resp = client.post(&url).json(completion).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("hub returned {} for completion POST", resp.status());
    }
    Ok(())
}
