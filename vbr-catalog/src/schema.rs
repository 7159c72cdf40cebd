//! Schema DDL (§6.6): VM contexts, VM disks (historical), backup jobs,
//! backup disks, backup chains + their ordered members, repositories.
//! Foreign keys cascade wherever a parent logically owns the child.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vm_contexts (
    context_id          TEXT PRIMARY KEY,
    vm_name             TEXT NOT NULL,
    source_inventory_id TEXT NOT NULL,
    hypervisor_host     TEXT NOT NULL,
    datacenter_path     TEXT NOT NULL,
    credential_ref      TEXT NOT NULL,
    state               TEXT NOT NULL,
    total_jobs          INTEGER NOT NULL DEFAULT 0,
    successful_jobs     INTEGER NOT NULL DEFAULT 0,
    failed_jobs         INTEGER NOT NULL DEFAULT 0,
    last_scheduled_at   TEXT
);

CREATE TABLE IF NOT EXISTS vm_disks (
    context_id          TEXT NOT NULL REFERENCES vm_contexts(context_id) ON DELETE CASCADE,
    disk_key            INTEGER NOT NULL,
    logical_index       INTEGER NOT NULL,
    capacity_bytes      INTEGER NOT NULL,
    provisioning_hint   TEXT NOT NULL,
    datastore           TEXT NOT NULL,
    last_change_id      TEXT,
    is_current          INTEGER NOT NULL,
    recorded_at         TEXT NOT NULL,
    PRIMARY KEY (context_id, disk_key, recorded_at)
);

CREATE TABLE IF NOT EXISTS repositories (
    repository_id       TEXT PRIMARY KEY,
    name                 TEXT NOT NULL,
    root_path            TEXT NOT NULL,
    capacity_hint_bytes   INTEGER,
    enabled              INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS backup_jobs (
    job_id              TEXT PRIMARY KEY,
    context_id          TEXT NOT NULL REFERENCES vm_contexts(context_id) ON DELETE CASCADE,
    backup_type         TEXT NOT NULL,
    repository_id       TEXT NOT NULL REFERENCES repositories(repository_id),
    status              TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    started_at          TEXT,
    completed_at        TEXT,
    bytes_transferred   INTEGER NOT NULL DEFAULT 0,
    progress_percent    REAL NOT NULL DEFAULT 0,
    phase               TEXT,
    speed_bps           REAL NOT NULL DEFAULT 0,
    last_telemetry_at   TEXT,
    force_full          INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_backup_jobs_context ON backup_jobs(context_id);

CREATE TABLE IF NOT EXISTS backup_disks (
    job_id              TEXT NOT NULL REFERENCES backup_jobs(job_id) ON DELETE CASCADE,
    disk_key            INTEGER NOT NULL,
    disk_index          INTEGER NOT NULL,
    allocated_port      INTEGER,
    export_name         TEXT NOT NULL,
    qcow2_path          TEXT NOT NULL,
    backing_file        TEXT,
    parent_change_id    TEXT,
    new_change_id       TEXT,
    bytes_transferred   INTEGER NOT NULL DEFAULT 0,
    status              TEXT NOT NULL,
    progress_percent    REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (job_id, disk_key)
);

CREATE TABLE IF NOT EXISTS backup_chains (
    chain_id            TEXT PRIMARY KEY,
    context_id          TEXT NOT NULL REFERENCES vm_contexts(context_id) ON DELETE CASCADE,
    disk_key            INTEGER NOT NULL,
    full_backup_id      TEXT NOT NULL REFERENCES backup_jobs(job_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_backup_chains_context_disk
    ON backup_chains(context_id, disk_key);

CREATE TABLE IF NOT EXISTS backup_chain_members (
    chain_id            TEXT NOT NULL REFERENCES backup_chains(chain_id) ON DELETE CASCADE,
    position             INTEGER NOT NULL,
    job_id               TEXT NOT NULL REFERENCES backup_jobs(job_id),
    PRIMARY KEY (chain_id, position)
);
"#;
