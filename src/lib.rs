pub mod advisory_lock;
pub mod control_channel;
pub mod job_engine;
pub mod rest;
pub mod state;
pub mod telemetry;
