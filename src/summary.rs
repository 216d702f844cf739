//! Run and job summary artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relay_protocol::error::ErrorCode;
use relay_protocol::event::{JobOutcome, TerminalRecord};

/// Schema version for summary.json.
pub const JOB_SUMMARY_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for summary.json.
pub const JOB_SUMMARY_SCHEMA_ID: &str = "relay/job_summary@1";

/// Schema version for run_summary.json.
pub const RUN_SUMMARY_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for run_summary.json.
pub const RUN_SUMMARY_SCHEMA_ID: &str = "relay/run_summary@1";

/// Per-job summary (summary.json in the job's artifact set).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub schema_version: u32,
    pub schema_id: String,
    pub run_id: String,
    pub job_id: String,
    pub attempt: u32,
    pub action: String,
    pub state: JobOutcome,
    pub exit_code: Option<i32>,
    pub error_code: Option<ErrorCode>,
    /// True when the terminal record was fabricated host-side.
    pub host_synthesized: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub events_observed: u64,
}

impl JobSummary {
    /// Build a summary from the terminal record and timing.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: impl Into<String>,
        job_id: impl Into<String>,
        attempt: u32,
        action: impl Into<String>,
        terminal: &TerminalRecord,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        events_observed: u64,
    ) -> Self {
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            schema_version: JOB_SUMMARY_SCHEMA_VERSION,
            schema_id: JOB_SUMMARY_SCHEMA_ID.to_string(),
            run_id: run_id.into(),
            job_id: job_id.into(),
            attempt,
            action: action.into(),
            state: terminal.state,
            exit_code: terminal.exit_code,
            error_code: terminal.error_code,
            host_synthesized: terminal.host_synthesized,
            started_at,
            finished_at,
            duration_ms,
            events_observed,
        }
    }
}

/// One step as recorded in the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub index: usize,
    pub action: String,
    pub job_id: String,
    pub attempt: u32,
    pub state: JobOutcome,
}

/// Run-level summary (run_summary.json in the run directory).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub schema_version: u32,
    pub schema_id: String,
    pub run_id: String,
    pub state: JobOutcome,
    /// Steps actually executed; aborted steps are absent.
    pub steps: Vec<StepSummary>,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    /// Aggregate step outcomes: the first non-success wins, success otherwise.
    pub fn aggregate_state(steps: &[StepSummary]) -> JobOutcome {
        steps
            .iter()
            .map(|step| step.state)
            .find(|state| *state != JobOutcome::Succeeded)
            .unwrap_or(JobOutcome::Succeeded)
    }
}
