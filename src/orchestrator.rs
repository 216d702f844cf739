//! Host orchestrator.
//!
//! Drives a run end to end: identity computation, probe and protocol
//! negotiation, `run` invocation, event-stream consumption through the job
//! state machine, and the local artifact commit. Steps execute sequentially;
//! a failed step aborts the remainder unless configured otherwise. The
//! orchestrator blocks only on transport I/O and the terminal record.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use relay_protocol::commit::{atomic_write, ArtifactCommitter, CommitError, CommitIdentity};
use relay_protocol::error::ErrorCode;
use relay_protocol::event::{JobOutcome, TerminalRecord};
use relay_protocol::request::{ConfigResolved, JobPaths, JobRequest};

use crate::host::transport::Transport;
use crate::host::{HostError, RpcClient};
use crate::identity::{
    compute_identity, generate_job_id, hash_source_tree, ConfigInputs, IdentityError, RunIdentity,
};
use crate::state::{JobStateMachine, StateError};
use crate::summary::{
    JobSummary, RunSummary, StepSummary, RUN_SUMMARY_SCHEMA_ID, RUN_SUMMARY_SCHEMA_VERSION,
};

/// Schema version for run_plan.json.
pub const RUN_PLAN_SCHEMA_VERSION: u32 = 1;

/// Schema identifier for run_plan.json.
pub const RUN_PLAN_SCHEMA_ID: &str = "relay/run_plan@1";

/// Poll interval while waiting on the event channel.
const RECV_INTERVAL: Duration = Duration::from_millis(100);

/// Orchestrator errors. Anything here aborts before or between jobs; job
/// outcomes themselves are reported through terminal records.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("worker RPC error: {0}")]
    Host(#[from] HostError),

    #[error("state machine error: {0}")]
    State(#[from] StateError),

    #[error("artifact commit error: {0}")]
    Commit(#[from] CommitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config contract v{version} unsupported by worker (supports [{min}, {max}])")]
    ContractUnsupported { version: u32, min: u32, max: u32 },

    #[error("run has no steps")]
    NoSteps,
}

impl OrchestratorError {
    /// Get the process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Identity(_) => 1,
            OrchestratorError::Host(_) => 20,
            OrchestratorError::ContractUnsupported { .. } => 21,
            OrchestratorError::State(_) => 40,
            OrchestratorError::Commit(_) => 70,
            OrchestratorError::Io(_) => 1,
            OrchestratorError::Serialization(_) => 1,
            OrchestratorError::NoSteps => 1,
        }
    }
}

/// Exit code for a finished run.
pub fn outcome_exit_code(outcome: JobOutcome) -> i32 {
    match outcome {
        JobOutcome::Succeeded => 0,
        JobOutcome::Failed => 50,
        JobOutcome::Canceled => 80,
        JobOutcome::TimedOut => 81,
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Local root for run directories.
    pub artifacts_dir: PathBuf,
    /// Name of the worker the run is bound to.
    pub worker: String,
    /// Backend recorded in `config_resolved` ("process" or "mock").
    pub backend: String,
    /// Per-job wall-clock timeout.
    pub timeout: Duration,
    /// Wait after a cancel request before synthesizing a terminal record.
    pub cancel_grace: Duration,
    /// Maximum attempts per step (retryable failures only).
    pub max_attempts: u32,
    /// Keep executing steps after a failure.
    pub continue_on_failure: bool,
    /// Request the event hash chain.
    pub integrity: bool,
    /// Exclude globs for source-tree hashing.
    pub excludes: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            artifacts_dir: PathBuf::from(format!("{}/.local/share/relay/artifacts", home)),
            worker: "local".to_string(),
            backend: "process".to_string(),
            timeout: Duration::from_secs(1800),
            cancel_grace: Duration::from_secs(10),
            max_attempts: 2,
            continue_on_failure: false,
            integrity: false,
            excludes: crate::identity::DEFAULT_EXCLUDES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// One planned step with its pre-allocated job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    pub action: String,
    pub job_id: String,
}

/// The run plan (run_plan.json), emitted before execution starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlan {
    pub schema_version: u32,
    pub schema_id: String,
    pub created_at: DateTime<Utc>,
    pub run_id: String,
    pub config_hash: String,
    pub source_tree_sha256: String,
    pub worker: String,
    pub protocol_version: i32,
    pub steps: Vec<PlanStep>,
    pub continue_on_failure: bool,
}

/// Outcome of one job attempt.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub attempt: u32,
    pub action: String,
    pub terminal: TerminalRecord,
    pub artifact_dir: PathBuf,
    pub events_observed: u64,
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub outcome: JobOutcome,
    pub steps: Vec<JobResult>,
    pub run_dir: PathBuf,
}

/// Drives runs against one worker.
pub struct Orchestrator {
    config: OrchestratorConfig,
    client: RpcClient,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Create an orchestrator bound to a transport.
    pub fn new(config: OrchestratorConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            config,
            client: RpcClient::new(transport),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The cancel flag; trip it (e.g. from a signal handler) to request a
    /// best-effort stop of the job in flight.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Compute identity and build the run plan. Refuses unstable config
    /// input before any job exists.
    pub fn plan(
        &mut self,
        inputs: &ConfigInputs,
        source_root: &std::path::Path,
    ) -> Result<RunPlan, OrchestratorError> {
        if inputs.steps.is_empty() {
            return Err(OrchestratorError::NoSteps);
        }

        let capabilities = self.client.probe()?;
        if inputs.contract_version < capabilities.contract_min
            || inputs.contract_version > capabilities.contract_max
        {
            return Err(OrchestratorError::ContractUnsupported {
                version: inputs.contract_version,
                min: capabilities.contract_min,
                max: capabilities.contract_max,
            });
        }

        let tree = hash_source_tree(source_root, &self.config.excludes)?;
        let identity: RunIdentity = compute_identity(inputs, &tree.sha256)?;

        let steps = inputs
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| PlanStep {
                index,
                action: step.action.clone(),
                job_id: generate_job_id(),
            })
            .collect();

        Ok(RunPlan {
            schema_version: RUN_PLAN_SCHEMA_VERSION,
            schema_id: RUN_PLAN_SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            run_id: identity.run_id,
            config_hash: identity.config_hash,
            source_tree_sha256: identity.source_tree_sha256,
            worker: self.config.worker.clone(),
            protocol_version: self.client.protocol_version(),
            steps,
            continue_on_failure: self.config.continue_on_failure,
        })
    }

    /// Execute the plan: one job at a time, in step order.
    pub fn execute(
        &mut self,
        plan: &RunPlan,
        inputs: &ConfigInputs,
    ) -> Result<RunResult, OrchestratorError> {
        let created_at = Utc::now();
        let run_dir = self.config.artifacts_dir.join(&plan.run_id);
        std::fs::create_dir_all(&run_dir)?;
        std::fs::write(
            run_dir.join("run_plan.json"),
            serde_json::to_string_pretty(plan)?,
        )?;

        let inputs_value = inputs.to_value()?;
        let mut results: Vec<JobResult> = Vec::new();
        for step in &plan.steps {
            let mut attempt = 1u32;
            let mut job_id = step.job_id.clone();
            let result = loop {
                let result =
                    self.drive_job(&run_dir, plan, inputs, &inputs_value, step, &job_id, attempt)?;

                let retryable = result.terminal.state == JobOutcome::Failed
                    && result
                        .terminal
                        .error_code
                        .map(|code| code.is_retryable())
                        .unwrap_or(false);
                if retryable && attempt < self.config.max_attempts {
                    attempt += 1;
                    job_id = generate_job_id();
                    continue;
                }
                break result;
            };

            let succeeded = result.terminal.state == JobOutcome::Succeeded;
            results.push(result);
            if !succeeded && !plan.continue_on_failure {
                break;
            }
        }

        let steps: Vec<StepSummary> = results
            .iter()
            .enumerate()
            .map(|(index, result)| StepSummary {
                index,
                action: result.action.clone(),
                job_id: result.job_id.clone(),
                attempt: result.attempt,
                state: result.terminal.state,
            })
            .collect();
        let outcome = RunSummary::aggregate_state(&steps);

        let summary = RunSummary {
            schema_version: RUN_SUMMARY_SCHEMA_VERSION,
            schema_id: RUN_SUMMARY_SCHEMA_ID.to_string(),
            run_id: plan.run_id.clone(),
            state: outcome,
            steps,
            created_at,
            finished_at: Utc::now(),
        };
        std::fs::write(
            run_dir.join("run_summary.json"),
            serde_json::to_string_pretty(&summary)?,
        )?;

        Ok(RunResult {
            run_id: plan.run_id.clone(),
            outcome,
            steps: results,
            run_dir,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn drive_job(
        &mut self,
        run_dir: &std::path::Path,
        plan: &RunPlan,
        inputs: &ConfigInputs,
        inputs_value: &serde_json::Value,
        step: &PlanStep,
        job_id: &str,
        attempt: u32,
    ) -> Result<JobResult, OrchestratorError> {
        let started_at = Utc::now();
        let job_dir = run_dir.join("jobs").join(job_id);
        std::fs::create_dir_all(&job_dir)?;

        let job = JobRequest {
            protocol_version: self.client.protocol_version(),
            job_id: job_id.to_string(),
            run_id: plan.run_id.clone(),
            attempt,
            config_inputs: inputs_value.clone(),
            config_resolved: ConfigResolved {
                worker: plan.worker.clone(),
                backend: self.config.backend.clone(),
                step_index: step.index,
                argv: inputs.steps[step.index].argv.clone(),
                device_id: None,
            },
            paths: JobPaths::default(),
            timeout_seconds: self.config.timeout.as_secs(),
            integrity: self.config.integrity,
        };
        std::fs::write(job_dir.join("job.json"), serde_json::to_string_pretty(&job)?)?;

        let mut sm = JobStateMachine::new(job_id, &plan.run_id, attempt);
        match self.client.start_run(&job) {
            Ok(reader) => self.pump_events(reader, &mut sm, &job_dir, job_id)?,
            // An unreachable worker yields a synthesized, retryable failure.
            Err(HostError::Transport(_)) => {
                let _ = sm.synthesize(TerminalRecord::failed(
                    None,
                    Some(ErrorCode::WorkerUnreachable),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        let terminal = match sm.terminal() {
            Some(terminal) => terminal.clone(),
            None => sm.force_incomplete()?.clone(),
        };
        let finished_at = Utc::now();

        atomic_write(
            &job_dir,
            "terminal.json",
            serde_json::to_string_pretty(&terminal)?.as_bytes(),
        )?;
        let summary = JobSummary::new(
            plan.run_id.clone(),
            job_id,
            attempt,
            step.action.clone(),
            &terminal,
            started_at,
            finished_at,
            sm.events_observed(),
        );
        atomic_write(
            &job_dir,
            "summary.json",
            serde_json::to_string_pretty(&summary)?.as_bytes(),
        )?;

        ArtifactCommitter::commit(
            &job_dir,
            &CommitIdentity {
                run_id: plan.run_id.clone(),
                job_id: job_id.to_string(),
                attempt,
                outcome: terminal.state,
            },
        )?;

        Ok(JobResult {
            job_id: job_id.to_string(),
            attempt,
            action: step.action.clone(),
            terminal,
            artifact_dir: job_dir,
            events_observed: sm.events_observed(),
        })
    }

    /// Consume the event stream until a terminal record exists: reported by
    /// the harness, or synthesized on truncation, corruption, cancel-grace
    /// expiry, or the host-side timeout backstop.
    fn pump_events(
        &self,
        reader: relay_protocol::codec::EventReader<Box<dyn std::io::BufRead + Send>>,
        sm: &mut JobStateMachine,
        job_dir: &std::path::Path,
        job_id: &str,
    ) -> Result<(), OrchestratorError> {
        let mut events_file = std::fs::File::create(job_dir.join("events.jsonl"))?;

        let (tx, rx) = mpsc::channel();
        let pump = thread::spawn(move || {
            for item in reader {
                let fatal = item.is_err();
                if tx.send(item).is_err() || fatal {
                    break;
                }
            }
        });

        let deadline = Instant::now() + self.config.timeout + self.config.cancel_grace;
        let mut cancel_sent = false;
        let mut cancel_deadline: Option<Instant> = None;
        while !sm.is_terminal() {
            match rx.recv_timeout(RECV_INTERVAL) {
                Ok(Ok(event)) => {
                    writeln!(events_file, "{}", serde_json::to_string(&event)?)?;
                    if sm.apply(&event).is_err() {
                        // Framing defect the codec could not see.
                        let _ = sm.force_corrupt();
                        break;
                    }
                }
                Ok(Err(_)) => {
                    let _ = sm.force_corrupt();
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    let _ = sm.force_incomplete();
                    break;
                }
            }

            if self.cancel.load(Ordering::SeqCst) && !cancel_sent {
                // Fire-and-forget; the harness still owns the outcome.
                let _ = self.client.cancel(job_id);
                cancel_sent = true;
                cancel_deadline = Some(Instant::now() + self.config.cancel_grace);
            }
            if let Some(at) = cancel_deadline {
                if Instant::now() >= at && !sm.is_terminal() {
                    let _ = sm.synthesize(TerminalRecord::canceled());
                    break;
                }
            }
            if Instant::now() >= deadline && !sm.is_terminal() {
                let _ = sm.synthesize(TerminalRecord::timed_out());
                break;
            }
        }

        // Dropping the receiver ends the pump thread; dropping the stream
        // tears down the session, which the worker observes as host loss.
        drop(rx);
        let _ = pump.join();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(outcome_exit_code(JobOutcome::Succeeded), 0);
        assert_eq!(outcome_exit_code(JobOutcome::Failed), 50);
        assert_eq!(outcome_exit_code(JobOutcome::Canceled), 80);
        assert_eq!(outcome_exit_code(JobOutcome::TimedOut), 81);
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(OrchestratorError::NoSteps.exit_code(), 1);
        assert_eq!(
            OrchestratorError::ContractUnsupported {
                version: 2,
                min: 1,
                max: 1
            }
            .exit_code(),
            21
        );
    }
}
