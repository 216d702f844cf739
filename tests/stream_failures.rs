//! Degraded-stream behavior.
//!
//! A truncated or corrupt event stream must never hang the host or
//! masquerade as a harness-reported outcome: the state machine reaches a
//! terminal `failed` with an explicit `host_synthesized` marker and a
//! distinguishing error code, and the artifact set still commits.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{worker_config, CannedTransport, LocalTransport};
use relay_exec::identity::ConfigInputs;
use relay_exec::orchestrator::{Orchestrator, OrchestratorConfig};
use relay_exec::{RpcClient, Transport};
use relay_protocol::codec::EventWriter;
use relay_protocol::commit;
use relay_protocol::error::ErrorCode;
use relay_protocol::event::{Event, JobOutcome, TerminalRecord};
use relay_worker::Harness;

fn orchestrator_with_stream(stream: Vec<u8>, artifacts_dir: &std::path::Path) -> Orchestrator {
    let config = OrchestratorConfig {
        artifacts_dir: artifacts_dir.to_path_buf(),
        worker: "canned".to_string(),
        backend: "mock".to_string(),
        timeout: Duration::from_secs(5),
        cancel_grace: Duration::from_secs(1),
        max_attempts: 1,
        ..OrchestratorConfig::default()
    };
    Orchestrator::new(config, Box::new(CannedTransport::new(stream)))
}

fn source_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();
    dir
}

/// A valid stream prefix for `job_id`, ending before any terminal event.
fn truncated_stream(job_id: &str) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut writer = EventWriter::new(&mut buffer, job_id, false);
    writer.write(Event::hello(job_id, &"c".repeat(64), 1, 1, false)).unwrap();
    writer.write(Event::lease_acquired(job_id, 1830)).unwrap();
    writer.write(Event::log(job_id, "making progress")).unwrap();
    buffer
}

#[test]
fn test_truncated_stream_synthesizes_failure() {
    let artifacts_dir = TempDir::new().unwrap();
    let source = source_dir();
    let inputs = ConfigInputs::single("build", vec!["exit=0".to_string()]);

    // The canned job id is unknown until the plan exists, so build the
    // orchestrator in two phases: plan first, then rebuild the stream.
    let mut probe_only = orchestrator_with_stream(Vec::new(), artifacts_dir.path());
    let plan = probe_only.plan(&inputs, source.path()).unwrap();
    let job_id = plan.steps[0].job_id.clone();

    let mut orchestrator =
        orchestrator_with_stream(truncated_stream(&job_id), artifacts_dir.path());
    let result = orchestrator.execute(&plan, &inputs).unwrap();

    assert_eq!(result.outcome, JobOutcome::Failed);
    let terminal = &result.steps[0].terminal;
    assert!(terminal.host_synthesized, "truncation must be host-fabricated");
    assert_eq!(terminal.error_code, Some(ErrorCode::EventStreamIncomplete));
    assert!(terminal.exit_code.is_none());

    // Even a degraded job yields a committed artifact set.
    assert!(commit::is_committed(&result.steps[0].artifact_dir));
    commit::verify(&result.steps[0].artifact_dir).unwrap();
}

#[test]
fn test_corrupt_stream_synthesizes_failure() {
    let artifacts_dir = TempDir::new().unwrap();
    let source = source_dir();
    let inputs = ConfigInputs::single("build", vec!["exit=0".to_string()]);

    let mut probe_only = orchestrator_with_stream(Vec::new(), artifacts_dir.path());
    let plan = probe_only.plan(&inputs, source.path()).unwrap();
    let job_id = plan.steps[0].job_id.clone();

    let mut stream = truncated_stream(&job_id);
    stream.extend_from_slice(b"{{{ not an event\n");

    let mut orchestrator = orchestrator_with_stream(stream, artifacts_dir.path());
    let result = orchestrator.execute(&plan, &inputs).unwrap();

    assert_eq!(result.outcome, JobOutcome::Failed);
    let terminal = &result.steps[0].terminal;
    assert!(terminal.host_synthesized);
    assert_eq!(terminal.error_code, Some(ErrorCode::EventStreamCorrupt));
}

#[test]
fn test_empty_stream_synthesizes_failure() {
    let artifacts_dir = TempDir::new().unwrap();
    let source = source_dir();
    let inputs = ConfigInputs::single("build", vec!["exit=0".to_string()]);

    let mut orchestrator = orchestrator_with_stream(Vec::new(), artifacts_dir.path());
    let plan = orchestrator.plan(&inputs, source.path()).unwrap();
    let result = orchestrator.execute(&plan, &inputs).unwrap();

    assert_eq!(result.outcome, JobOutcome::Failed);
    assert!(result.steps[0].terminal.host_synthesized);
    assert_eq!(
        result.steps[0].terminal.error_code,
        Some(ErrorCode::EventStreamIncomplete)
    );
}

#[test]
fn test_harness_terminal_is_never_marked_synthesized() {
    let artifacts_dir = TempDir::new().unwrap();
    let source = source_dir();
    let inputs = ConfigInputs::single("build", vec!["exit=0".to_string()]);

    let mut probe_only = orchestrator_with_stream(Vec::new(), artifacts_dir.path());
    let plan = probe_only.plan(&inputs, source.path()).unwrap();
    let job_id = plan.steps[0].job_id.clone();

    let mut buffer = Vec::new();
    let mut writer = EventWriter::new(&mut buffer, job_id.as_str(), false);
    writer.write(Event::hello(&job_id, &plan.run_id, 1, 1, false)).unwrap();
    writer.write(Event::lease_acquired(&job_id, 1830)).unwrap();
    writer.write(Event::collecting(&job_id)).unwrap();
    writer
        .write(Event::complete(&job_id, TerminalRecord::succeeded(0)))
        .unwrap();

    let mut orchestrator = orchestrator_with_stream(buffer, artifacts_dir.path());
    let result = orchestrator.execute(&plan, &inputs).unwrap();
    assert_eq!(result.outcome, JobOutcome::Succeeded);
    assert!(!result.steps[0].terminal.host_synthesized);
}

/// Fails `open_run` a configured number of times, then serves a valid
/// stream synthesized from the incoming job request.
struct FlakyTransport {
    failures_remaining: std::sync::Mutex<u32>,
}

impl Transport for FlakyTransport {
    fn call(
        &self,
        request: &relay_protocol::envelope::RpcRequest,
    ) -> Result<relay_protocol::envelope::RpcResponse, relay_exec::TransportError> {
        CannedTransport::new(Vec::new()).call(request)
    }

    fn open_run(
        &self,
        request: &relay_protocol::envelope::RpcRequest,
    ) -> Result<Box<dyn std::io::BufRead + Send>, relay_exec::TransportError> {
        let mut failures = self.failures_remaining.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(relay_exec::TransportError::ConnectionFailed(
                "worker offline".to_string(),
            ));
        }

        let job: relay_protocol::request::JobRequest =
            serde_json::from_value(request.payload.clone()).expect("valid job request");
        let mut buffer = Vec::new();
        let mut writer = EventWriter::new(&mut buffer, job.job_id.as_str(), false);
        writer
            .write(Event::hello(&job.job_id, &job.run_id, job.attempt, 1, false))
            .unwrap();
        writer.write(Event::lease_acquired(&job.job_id, 1830)).unwrap();
        writer.write(Event::collecting(&job.job_id)).unwrap();
        writer
            .write(Event::complete(&job.job_id, TerminalRecord::succeeded(0)))
            .unwrap();
        Ok(Box::new(std::io::Cursor::new(buffer)))
    }
}

#[test]
fn test_unreachable_worker_is_retried() {
    let artifacts_dir = TempDir::new().unwrap();
    let source = source_dir();
    let inputs = ConfigInputs::single("build", vec!["exit=0".to_string()]);

    let config = OrchestratorConfig {
        artifacts_dir: artifacts_dir.path().to_path_buf(),
        worker: "flaky".to_string(),
        backend: "mock".to_string(),
        timeout: Duration::from_secs(5),
        cancel_grace: Duration::from_secs(1),
        max_attempts: 2,
        ..OrchestratorConfig::default()
    };
    let transport = FlakyTransport {
        failures_remaining: std::sync::Mutex::new(1),
    };
    let mut orchestrator = Orchestrator::new(config, Box::new(transport));

    let plan = orchestrator.plan(&inputs, source.path()).unwrap();
    let result = orchestrator.execute(&plan, &inputs).unwrap();

    // First attempt hit worker_unreachable (retryable); the second ran.
    assert_eq!(result.outcome, JobOutcome::Succeeded);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].attempt, 2);
    // Retries never reuse a job id.
    assert_ne!(result.steps[0].job_id, plan.steps[0].job_id);
}

#[test]
fn test_unreachable_worker_exhausts_attempts() {
    let artifacts_dir = TempDir::new().unwrap();
    let source = source_dir();
    let inputs = ConfigInputs::single("build", vec!["exit=0".to_string()]);

    let config = OrchestratorConfig {
        artifacts_dir: artifacts_dir.path().to_path_buf(),
        worker: "down".to_string(),
        backend: "mock".to_string(),
        timeout: Duration::from_secs(5),
        cancel_grace: Duration::from_secs(1),
        max_attempts: 2,
        ..OrchestratorConfig::default()
    };
    let transport = FlakyTransport {
        failures_remaining: std::sync::Mutex::new(u32::MAX),
    };
    let mut orchestrator = Orchestrator::new(config, Box::new(transport));

    let plan = orchestrator.plan(&inputs, source.path()).unwrap();
    let result = orchestrator.execute(&plan, &inputs).unwrap();

    assert_eq!(result.outcome, JobOutcome::Failed);
    assert_eq!(result.steps[0].attempt, 2);
    let terminal = &result.steps[0].terminal;
    assert!(terminal.host_synthesized);
    assert_eq!(terminal.error_code, Some(ErrorCode::WorkerUnreachable));
}

#[test]
fn test_cancel_is_idempotent_through_the_wire() {
    let worker_dir = TempDir::new().unwrap();
    let harness = Arc::new(Harness::new(worker_config(worker_dir.path())));
    let client = RpcClient::new(Box::new(LocalTransport::new(harness)));

    // Unknown job: success, not acknowledged.
    let first = client.cancel("job-never-existed").unwrap();
    assert!(!first.acknowledged);

    // Canceling again is equally fine.
    let second = client.cancel("job-never-existed").unwrap();
    assert!(!second.acknowledged);
}

#[test]
fn test_cancel_twice_on_live_job() {
    let worker_dir = TempDir::new().unwrap();
    let harness = Arc::new(Harness::new(worker_config(worker_dir.path())));
    let stop = harness.cancels().register("job-live");
    let client = RpcClient::new(Box::new(LocalTransport::new(harness.clone())));

    let first = client.cancel("job-live").unwrap();
    assert!(first.acknowledged);
    let second = client.cancel("job-live").unwrap();
    assert!(second.acknowledged);
    assert!(stop.is_set());
}
