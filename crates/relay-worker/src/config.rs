//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Minimum supported protocol version.
    pub protocol_min: i32,
    /// Maximum supported protocol version.
    pub protocol_max: i32,
    /// Minimum supported config contract version.
    pub contract_min: u32,
    /// Maximum supported config contract version.
    pub contract_max: u32,
    /// Maximum concurrent jobs allowed.
    pub max_concurrent_jobs: u32,
    /// Root under which all job workspaces are derived.
    pub work_root: PathBuf,
    /// Cadence of `queued` events while waiting for a lease.
    pub queue_interval: Duration,
    /// Added to the job timeout to form the lease TTL.
    pub lease_grace: Duration,
    /// Upper bound on any granted lease TTL.
    pub max_lease_ttl: Duration,
    /// Grace between SIGTERM and forced kill of a backend process group.
    pub kill_grace: Duration,
    /// Supported features.
    pub features: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            protocol_min: 1,
            protocol_max: 1,
            contract_min: 1,
            contract_max: 1,
            max_concurrent_jobs: 1,
            work_root: std::env::temp_dir().join("relay-worker"),
            queue_interval: Duration::from_secs(10),
            lease_grace: Duration::from_secs(120),
            max_lease_ttl: Duration::from_secs(1800),
            kill_grace: Duration::from_secs(5),
            features: vec![
                "probe".to_string(),
                "run".to_string(),
                "cancel".to_string(),
                "integrity".to_string(),
                "queue_position".to_string(),
            ],
        }
    }
}
