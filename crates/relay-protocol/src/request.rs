//! Operation payloads: the job request object, probe capabilities, cancel.

use serde::{Deserialize, Serialize};

/// Execution-time facts resolved by the host. These accompany a job but
/// MUST NOT affect its run identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigResolved {
    /// Name of the chosen worker.
    pub worker: String,
    /// Backend selected for this job ("process" or "mock"); chosen once,
    /// never re-decided mid-job.
    pub backend: String,
    /// Index of the step this job executes within its run plan.
    pub step_index: usize,
    /// Concrete argv for the backend.
    pub argv: Vec<String>,
    /// Resolved device identifier, when the action targets one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Host-supplied path hints. The harness derives all working paths from its
/// own configured roots and the job id; hints are only honored after
/// confinement validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPaths {
    /// Relative subdirectory for staged source, if the host wants one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Relative subdirectory for the result bundle, if the host wants one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<String>,
}

/// The job request object carried by the `run` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Protocol version selected by the host after probe.
    pub protocol_version: i32,
    /// Globally unique, never-reused job identifier.
    pub job_id: String,
    /// Content-derived run identity.
    pub run_id: String,
    /// 1-based attempt number within the run.
    pub attempt: u32,
    /// The hashable configuration envelope that produced `run_id`.
    pub config_inputs: serde_json::Value,
    /// Execution-time facts excluded from `run_id`.
    pub config_resolved: ConfigResolved,
    /// Path hints, validated against the worker's roots.
    #[serde(default)]
    pub paths: JobPaths,
    /// Overall wall-clock timeout for the job.
    pub timeout_seconds: u64,
    /// Whether events must carry the integrity hash chain.
    #[serde(default)]
    pub integrity: bool,
}

/// Current load advertised by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Load {
    /// Jobs currently holding a lease.
    pub active_jobs: u32,
    /// Jobs waiting for a lease.
    pub queued_jobs: u32,
    /// Configured concurrency bound.
    pub max_concurrent_jobs: u32,
}

/// Capability descriptor returned by `probe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeCapabilities {
    /// Minimum supported protocol version.
    pub protocol_min: i32,
    /// Maximum supported protocol version.
    pub protocol_max: i32,
    /// Minimum supported config contract version.
    pub contract_min: u32,
    /// Maximum supported config contract version.
    pub contract_max: u32,
    /// Harness version string.
    pub harness_version: String,
    /// Supported feature names.
    pub features: Vec<String>,
    /// Current load.
    pub load: Load,
    /// Root directory under which all job workspaces are derived.
    pub work_root: String,
}

/// Cancel request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Job to cancel.
    pub job_id: String,
}

/// Cancel response payload. Cancel always succeeds at the envelope level;
/// `acknowledged` reports whether an active job was actually signaled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Echoed job id.
    pub job_id: String,
    /// True if the job was active and has been signaled to stop.
    pub acknowledged: bool,
}
