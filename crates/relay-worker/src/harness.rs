//! Worker session handler.
//!
//! One transport session carries exactly one request. `probe` and `cancel`
//! answer with a single response envelope; `run` answers with the job's
//! event stream: `hello` first, `complete` last, sequences contiguous.
//!
//! Lease liveness is tied to the session itself, not a heartbeat RPC. For
//! `run`, the host holds its side of the session open; a monitor thread
//! watches the request channel for EOF, and an event-write failure means
//! the same thing. Either way the backend process group is stopped and the
//! workspace is flagged for cleanup. Lease TTL or timeout expiry always
//! produces a terminal event, never silence.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use relay_protocol::codec::{CodecError, EventWriter};
use relay_protocol::commit::{atomic_write, ArtifactCommitter, CommitIdentity};
use relay_protocol::envelope::{Operation, RpcRequest, RpcResponse};
use relay_protocol::error::{ErrorCode, RpcError};
use relay_protocol::event::{Event, TerminalRecord};
use relay_protocol::request::{CancelRequest, CancelResponse, JobRequest, Load, ProbeCapabilities};
use relay_protocol::{LANE_VERSION, PROTOCOL_VERSION_PROBE};

use crate::backend::{select_backend, BackendExit};
use crate::cancel::{CancelRegistry, StopCause, StopState};
use crate::config::WorkerConfig;
use crate::lease::{LeaseAttempt, LeaseManager};
use crate::paths::JobWorkspace;

/// Poll interval for the event pump.
const PUMP_INTERVAL: Duration = Duration::from_millis(50);

/// The worker harness: config plus the shared lease and cancel state.
pub struct Harness {
    config: WorkerConfig,
    leases: LeaseManager,
    cancels: CancelRegistry,
}

impl Harness {
    /// Create a harness with fresh shared state.
    pub fn new(config: WorkerConfig) -> Self {
        let leases = LeaseManager::new(config.max_concurrent_jobs);
        Self {
            config,
            leases,
            cancels: CancelRegistry::new(),
        }
    }

    /// The lease manager (shared across sessions).
    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// The cancel registry (shared across sessions).
    pub fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    /// Serve one session on stdin/stdout.
    pub fn run(&self) -> io::Result<()> {
        self.run_session(BufReader::new(io::stdin()), &mut io::stdout().lock())
    }

    /// Serve one session with custom I/O (for testing).
    ///
    /// The reader is taken by value: after the request line it becomes the
    /// session liveness monitor for `run`.
    pub fn run_session<R, W>(&self, mut reader: R, writer: &mut W) -> io::Result<()>
    where
        R: BufRead + Send + 'static,
        W: Write,
    {
        let request = match read_request(&mut reader) {
            Ok(request) => request,
            Err(e) => {
                let response = RpcResponse::error(PROTOCOL_VERSION_PROBE, String::new(), e);
                return write_response(writer, &response);
            }
        };

        if let Err(e) = self.validate_protocol_version(&request) {
            let response =
                RpcResponse::error(request.protocol_version, request.request_id.clone(), e);
            return write_response(writer, &response);
        }

        match request.op.as_str() {
            op if op == Operation::Probe.as_str() => {
                let response = RpcResponse::success(
                    PROTOCOL_VERSION_PROBE,
                    request.request_id.clone(),
                    serde_json::to_value(self.probe())
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
                );
                write_response(writer, &response)
            }
            op if op == Operation::Cancel.as_str() => {
                let response = self.handle_cancel(&request);
                write_response(writer, &response)
            }
            op if op == Operation::Run.as_str() => self.handle_run(&request, reader, writer),
            other => {
                let response = RpcResponse::error(
                    request.protocol_version,
                    request.request_id.clone(),
                    RpcError::unknown_operation(other),
                );
                write_response(writer, &response)
            }
        }
    }

    fn validate_protocol_version(&self, request: &RpcRequest) -> Result<(), RpcError> {
        if request.op == Operation::Probe.as_str() {
            if request.protocol_version != PROTOCOL_VERSION_PROBE {
                return Err(RpcError::unsupported_protocol(
                    request.protocol_version,
                    PROTOCOL_VERSION_PROBE,
                    PROTOCOL_VERSION_PROBE,
                ));
            }
            return Ok(());
        }

        if request.protocol_version < self.config.protocol_min
            || request.protocol_version > self.config.protocol_max
        {
            return Err(RpcError::unsupported_protocol(
                request.protocol_version,
                self.config.protocol_min,
                self.config.protocol_max,
            ));
        }
        Ok(())
    }

    /// Build the probe capability descriptor. No job side effects.
    pub fn probe(&self) -> ProbeCapabilities {
        ProbeCapabilities {
            protocol_min: self.config.protocol_min,
            protocol_max: self.config.protocol_max,
            contract_min: self.config.contract_min,
            contract_max: self.config.contract_max,
            harness_version: LANE_VERSION.to_string(),
            features: self.config.features.clone(),
            load: Load {
                active_jobs: self.leases.active_count() as u32,
                queued_jobs: self.leases.queued_count() as u32,
                max_concurrent_jobs: self.config.max_concurrent_jobs,
            },
            work_root: self.config.work_root.to_string_lossy().to_string(),
        }
    }

    fn handle_cancel(&self, request: &RpcRequest) -> RpcResponse {
        let cancel: CancelRequest = match serde_json::from_value(request.payload.clone()) {
            Ok(cancel) => cancel,
            Err(e) => {
                return RpcResponse::error(
                    request.protocol_version,
                    request.request_id.clone(),
                    RpcError::invalid_request(format!("invalid cancel request: {}", e)),
                )
            }
        };

        // Idempotent: unknown or already-finished jobs still succeed.
        let acknowledged = self.cancels.request(&cancel.job_id);
        let payload = serde_json::to_value(CancelResponse {
            job_id: cancel.job_id,
            acknowledged,
        })
        .unwrap_or(serde_json::Value::Null);
        RpcResponse::success(request.protocol_version, request.request_id.clone(), payload)
    }

    fn handle_run<R, W>(&self, request: &RpcRequest, reader: R, writer: &mut W) -> io::Result<()>
    where
        R: Read + Send + 'static,
        W: Write,
    {
        let job: JobRequest = match serde_json::from_value(request.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                let response = RpcResponse::error(
                    request.protocol_version,
                    request.request_id.clone(),
                    RpcError::invalid_request(format!("invalid job request: {}", e)),
                );
                return write_response(writer, &response);
            }
        };

        let mut events = EventWriter::new(writer, job.job_id.as_str(), job.integrity);

        let workspace = match JobWorkspace::resolve(&self.config.work_root, &job.job_id, &job.paths)
        {
            Ok(workspace) => workspace,
            Err(_) => {
                // Confinement violation: a well-formed two-event stream.
                return finish_stream(&mut events, &job, |_| {
                    TerminalRecord::failed(None, Some(ErrorCode::PathOutOfBounds))
                });
            }
        };
        if workspace.create().is_err() {
            return finish_stream(&mut events, &job, |_| TerminalRecord::failed(None, None));
        }

        let stop = self.cancels.register(&job.job_id);
        spawn_session_monitor(reader, stop.clone());

        let result = self.drive(&mut events, &job, &workspace, &stop);
        self.cancels.unregister(&job.job_id);

        if let Err(e) = result {
            // Session lost mid-run: backend already stopped, workspace flagged.
            workspace.mark_for_cleanup();
            return match e {
                CodecError::Io(io_err) => Err(io_err),
                other => Err(io::Error::new(io::ErrorKind::InvalidData, other.to_string())),
            };
        }
        Ok(())
    }

    fn drive<W: Write>(
        &self,
        events: &mut EventWriter<&mut W>,
        job: &JobRequest,
        workspace: &JobWorkspace,
        stop: &Arc<StopState>,
    ) -> Result<(), CodecError> {
        let timeout = Duration::from_secs(job.timeout_seconds);
        let deadline = Instant::now() + timeout;
        let ttl = (timeout + self.config.lease_grace).min(self.config.max_lease_ttl);

        events.write(Event::hello(
            &job.job_id,
            &job.run_id,
            job.attempt,
            job.protocol_version,
            self.leases.is_saturated(),
        ))?;
        write_status(workspace, "queued");

        // Lease acquisition; backend execution never starts before
        // lease_acquired is emitted.
        let guard = loop {
            match stop.cause() {
                Some(StopCause::SessionLost) => {
                    self.leases.abandon(&job.job_id);
                    return Err(session_lost_error());
                }
                Some(_) => {
                    self.leases.abandon(&job.job_id);
                    events.write(Event::complete(&job.job_id, TerminalRecord::canceled()))?;
                    return Ok(());
                }
                None => {}
            }
            match self.leases.try_acquire(&job.job_id, ttl) {
                LeaseAttempt::Acquired(lease) => break self.leases.guard(lease),
                LeaseAttempt::Queued { position } => {
                    if Instant::now() >= deadline {
                        self.leases.abandon(&job.job_id);
                        events.write(Event::complete(
                            &job.job_id,
                            TerminalRecord::failed(None, Some(ErrorCode::LeaseUnavailable)),
                        ))?;
                        return Ok(());
                    }
                    events.write(Event::queued(&job.job_id, position as u32))?;
                    thread::sleep(self.config.queue_interval);
                }
            }
        };

        events.write(Event::lease_acquired(&job.job_id, ttl.as_secs()))?;
        write_status(workspace, "running");

        let backend = match select_backend(job) {
            Ok(backend) => backend,
            Err(e) => {
                events.write(Event::log(&job.job_id, e.to_string()))?;
                events.write(Event::complete(
                    &job.job_id,
                    TerminalRecord::failed(None, None),
                ))?;
                return Ok(());
            }
        };

        let (log_tx, log_rx) = mpsc::channel::<String>();
        let ctx = crate::backend::ExecContext {
            workspace: workspace.clone(),
            log: log_tx,
            stop: stop.clone(),
            kill_grace: self.config.kill_grace,
        };
        let thread_job = job.clone();
        let handle = thread::spawn(move || backend.execute(&thread_job, &ctx));

        let mut build_log = String::new();
        let mut session_lost: Option<CodecError> = None;
        loop {
            match log_rx.recv_timeout(PUMP_INTERVAL) {
                Ok(line) => {
                    build_log.push_str(&line);
                    build_log.push('\n');
                    if let Err(e) = events.write(Event::log(&job.job_id, line)) {
                        stop.trip(StopCause::SessionLost);
                        session_lost = Some(e);
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if stop.cause() == Some(StopCause::SessionLost) {
                session_lost = Some(session_lost_error());
                break;
            }
            if !stop.is_set() {
                if Instant::now() >= deadline {
                    stop.trip(StopCause::TimedOut);
                } else if guard.lease().is_expired() {
                    stop.trip(StopCause::LeaseExpired);
                }
            }
        }

        let backend_result = handle.join();
        if let Some(e) = session_lost {
            return Err(e);
        }

        events.write(Event::collecting(&job.job_id))?;
        write_status(workspace, "collecting");

        let exit = match backend_result {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(backend_err)) => {
                events.write(Event::log(&job.job_id, backend_err.to_string()))?;
                None
            }
            Err(_) => {
                events.write(Event::log(&job.job_id, "backend panicked"))?;
                None
            }
        };

        let mut terminal = terminal_for(stop.cause(), exit);
        if let Err(e) = self.seal_bundle(job, workspace, &build_log, &terminal) {
            // An uncommitted bundle is invisible to consumers; downgrade.
            events.write(Event::log(
                &job.job_id,
                format!("artifact commit failed: {}", e),
            ))?;
            terminal = TerminalRecord::failed(terminal.exit_code, None);
        }

        events.write(Event::complete(&job.job_id, terminal))?;
        Ok(())
    }

    /// Write the result bundle and run the two-phase commit.
    fn seal_bundle(
        &self,
        job: &JobRequest,
        workspace: &JobWorkspace,
        build_log: &str,
        terminal: &TerminalRecord,
    ) -> Result<(), Box<dyn std::error::Error>> {
        std::fs::write(workspace.artifact_dir.join("build.log"), build_log)?;
        atomic_write(
            &workspace.artifact_dir,
            "terminal.json",
            serde_json::to_string_pretty(terminal)?.as_bytes(),
        )?;
        ArtifactCommitter::commit(
            &workspace.artifact_dir,
            &CommitIdentity {
                run_id: job.run_id.clone(),
                job_id: job.job_id.clone(),
                attempt: job.attempt,
                outcome: terminal.state,
            },
        )?;
        Ok(())
    }
}

fn read_request<R: BufRead>(reader: &mut R) -> Result<RpcRequest, RpcError> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|e| RpcError::invalid_request(format!("failed to read request: {}", e)))?;
    serde_json::from_str(&line)
        .map_err(|e| RpcError::invalid_request(format!("invalid JSON: {}", e)))
}

/// Watch the host's side of the session. EOF or a read error means the host
/// is gone; the job must not keep running.
fn spawn_session_monitor<R: Read + Send + 'static>(mut reader: R, stop: Arc<StopState>) {
    thread::spawn(move || {
        let mut buf = [0u8; 256];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                // Stray input after the request is ignored.
                Ok(_) => {}
            }
        }
        stop.trip(StopCause::SessionLost);
    });
}

fn session_lost_error() -> CodecError {
    CodecError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "transport session lost",
    ))
}

/// Map the stop cause (or backend exit) to the terminal record.
fn terminal_for(cause: Option<StopCause>, exit: Option<BackendExit>) -> TerminalRecord {
    match cause {
        Some(StopCause::Canceled) => TerminalRecord::canceled(),
        Some(StopCause::TimedOut) => TerminalRecord::timed_out(),
        Some(StopCause::LeaseExpired) | Some(StopCause::SessionLost) => {
            TerminalRecord::failed(None, Some(ErrorCode::LeaseExpired))
        }
        None => match exit {
            Some(exit) if exit.exit_code == 0 => TerminalRecord::succeeded(0),
            Some(exit) => TerminalRecord::failed(Some(exit.exit_code), None),
            None => TerminalRecord::failed(None, None),
        },
    }
}

/// Emit the minimal valid stream for a job that never started.
fn finish_stream<W: Write, F>(
    events: &mut EventWriter<&mut W>,
    job: &JobRequest,
    terminal: F,
) -> io::Result<()>
where
    F: FnOnce(&JobRequest) -> TerminalRecord,
{
    let emit = || -> Result<(), CodecError> {
        events.write(Event::hello(
            &job.job_id,
            &job.run_id,
            job.attempt,
            job.protocol_version,
            false,
        ))?;
        events.write(Event::complete(&job.job_id, terminal(job)))?;
        Ok(())
    };
    match emit() {
        Ok(()) => Ok(()),
        Err(CodecError::Io(e)) => Err(e),
        Err(other) => Err(io::Error::new(io::ErrorKind::InvalidData, other.to_string())),
    }
}

/// Best-effort live status file; atomic replace is the one permitted
/// mutation of a non-terminal artifact directory.
fn write_status(workspace: &JobWorkspace, phase: &str) {
    let body = serde_json::json!({ "phase": phase });
    let _ = atomic_write(
        &workspace.artifact_dir,
        "status.json",
        body.to_string().as_bytes(),
    );
}

fn write_response<W: Write>(writer: &mut W, response: &RpcResponse) -> io::Result<()> {
    let json = serde_json::to_string(response)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writeln!(writer, "{}", json)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::session_pipe;
    use relay_protocol::codec::EventReader;
    use relay_protocol::event::{EventKind, JobOutcome};
    use relay_protocol::request::{ConfigResolved, JobPaths};
    use std::io::Cursor;

    fn harness() -> (Harness, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let config = WorkerConfig {
            work_root: dir.path().to_path_buf(),
            queue_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        };
        (Harness::new(config), dir)
    }

    fn job_request(job_id: &str, argv: Vec<&str>) -> JobRequest {
        JobRequest {
            protocol_version: 1,
            job_id: job_id.to_string(),
            run_id: "a".repeat(64),
            attempt: 1,
            config_inputs: serde_json::json!({"contract_version": 1}),
            config_resolved: ConfigResolved {
                worker: "local".to_string(),
                backend: "mock".to_string(),
                step_index: 0,
                argv: argv.into_iter().map(String::from).collect(),
                device_id: None,
            },
            paths: JobPaths::default(),
            timeout_seconds: 30,
            integrity: false,
        }
    }

    /// Run one session, holding the request channel open until it finishes
    /// (the host side of session liveness).
    fn run_session_bytes(harness: &Harness, request: &RpcRequest) -> Vec<u8> {
        let (mut host_side, worker_side) = session_pipe();
        writeln!(host_side, "{}", serde_json::to_string(request).unwrap()).unwrap();

        let mut output = Vec::new();
        harness
            .run_session(BufReader::new(worker_side), &mut output)
            .unwrap();
        drop(host_side);
        output
    }

    fn run_job(harness: &Harness, job: &JobRequest) -> Vec<Event> {
        let request = RpcRequest::new(
            1,
            Operation::Run,
            "req-1",
            serde_json::to_value(job).unwrap(),
        );
        let output = run_session_bytes(harness, &request);
        EventReader::new(output.as_slice(), false)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_probe_request() {
        let (harness, _dir) = harness();
        let input = r#"{"protocol_version":0,"op":"probe","request_id":"test-001","payload":{}}
"#;
        let mut output = Vec::new();
        harness
            .run_session(Cursor::new(input.as_bytes().to_vec()), &mut output)
            .unwrap();

        let response: RpcResponse = serde_json::from_slice(&output).unwrap();
        assert!(response.ok);
        assert_eq!(response.protocol_version, 0);
        let capabilities: ProbeCapabilities =
            serde_json::from_value(response.payload.unwrap()).unwrap();
        assert_eq!(capabilities.protocol_min, 1);
        assert_eq!(capabilities.load.active_jobs, 0);
    }

    #[test]
    fn test_probe_with_wrong_version() {
        let (harness, _dir) = harness();
        let input = r#"{"protocol_version":1,"op":"probe","request_id":"test-002","payload":{}}
"#;
        let mut output = Vec::new();
        harness
            .run_session(Cursor::new(input.as_bytes().to_vec()), &mut output)
            .unwrap();

        let response: RpcResponse = serde_json::from_slice(&output).unwrap();
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().code, ErrorCode::UnsupportedProtocol);
    }

    #[test]
    fn test_invalid_json() {
        let (harness, _dir) = harness();
        let mut output = Vec::new();
        harness
            .run_session(Cursor::new(b"not valid json\n".to_vec()), &mut output)
            .unwrap();

        let response: RpcResponse = serde_json::from_slice(&output).unwrap();
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn test_unknown_operation() {
        let (harness, _dir) = harness();
        let input = r#"{"protocol_version":1,"op":"teleport","request_id":"test-003","payload":{}}
"#;
        let mut output = Vec::new();
        harness
            .run_session(Cursor::new(input.as_bytes().to_vec()), &mut output)
            .unwrap();

        let response: RpcResponse = serde_json::from_slice(&output).unwrap();
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().code, ErrorCode::UnknownOperation);
    }

    #[test]
    fn test_run_success_stream() {
        let (harness, _dir) = harness();
        let job = job_request("job-ok", vec!["exit=0", "log=compiling"]);
        let events = run_job(&harness, &job);

        assert_eq!(events.first().unwrap().kind, EventKind::Hello);
        assert_eq!(events.last().unwrap().kind, EventKind::Complete);
        assert!(events.iter().any(|e| e.kind == EventKind::LeaseAcquired));
        assert!(events.iter().any(|e| e.kind == EventKind::Collecting));
        let terminal = events.last().unwrap().terminal.clone().unwrap();
        assert_eq!(terminal.state, JobOutcome::Succeeded);
        assert_eq!(terminal.exit_code, Some(0));
        assert!(!terminal.host_synthesized);
    }

    #[test]
    fn test_run_commits_artifacts() {
        let (harness, dir) = harness();
        let job = job_request("job-art", vec!["exit=0", "artifact=out.txt:payload"]);
        run_job(&harness, &job);

        let artifact_dir = dir.path().join("jobs/job-art/artifacts");
        assert!(relay_protocol::commit::is_committed(&artifact_dir));
        let manifest = relay_protocol::commit::verify(&artifact_dir).unwrap();
        assert!(manifest.entries.iter().any(|e| e.path == "out.txt"));
        assert!(manifest.entries.iter().any(|e| e.path == "build.log"));
        assert!(manifest.entries.iter().any(|e| e.path == "terminal.json"));
    }

    #[test]
    fn test_run_failure_exit_code() {
        let (harness, _dir) = harness();
        let job = job_request("job-fail", vec!["exit=65"]);
        let events = run_job(&harness, &job);

        let terminal = events.last().unwrap().terminal.clone().unwrap();
        assert_eq!(terminal.state, JobOutcome::Failed);
        assert_eq!(terminal.exit_code, Some(65));
        assert!(terminal.error_code.is_none());
    }

    #[test]
    fn test_run_rejects_escaping_paths() {
        let (harness, _dir) = harness();
        let mut job = job_request("job-esc", vec!["exit=0"]);
        job.paths.artifacts = Some("../../outside".to_string());
        let events = run_job(&harness, &job);

        assert_eq!(events.len(), 2);
        let terminal = events.last().unwrap().terminal.clone().unwrap();
        assert_eq!(terminal.state, JobOutcome::Failed);
        assert_eq!(terminal.error_code, Some(ErrorCode::PathOutOfBounds));
    }

    #[test]
    fn test_run_timeout() {
        let (harness, _dir) = harness();
        let mut job = job_request("job-slow", vec!["exit=0", "sleep_ms=5000"]);
        job.timeout_seconds = 0;
        let events = run_job(&harness, &job);

        let terminal = events.last().unwrap().terminal.clone().unwrap();
        assert_eq!(terminal.state, JobOutcome::TimedOut);
        assert_eq!(terminal.error_code, Some(ErrorCode::Timeout));
    }

    #[test]
    fn test_cancel_unknown_job_succeeds() {
        let (harness, _dir) = harness();
        let input = r#"{"protocol_version":1,"op":"cancel","request_id":"test-004","payload":{"job_id":"nope"}}
"#;
        let mut output = Vec::new();
        harness
            .run_session(Cursor::new(input.as_bytes().to_vec()), &mut output)
            .unwrap();

        let response: RpcResponse = serde_json::from_slice(&output).unwrap();
        assert!(response.ok);
        let cancel: CancelResponse = serde_json::from_value(response.payload.unwrap()).unwrap();
        assert!(!cancel.acknowledged);
    }

    #[test]
    fn test_integrity_stream_verifies() {
        let (harness, _dir) = harness();
        let mut job = job_request("job-chain", vec!["exit=0", "log=one", "log=two"]);
        job.integrity = true;

        let request = RpcRequest::new(
            1,
            Operation::Run,
            "req-chain",
            serde_json::to_value(&job).unwrap(),
        );
        let output = run_session_bytes(&harness, &request);

        let mut verified = EventReader::new(output.as_slice(), true);
        let events: Vec<Event> = verified.by_ref().collect::<Result<_, _>>().unwrap();
        assert!(verified.saw_complete());
        assert!(events.last().unwrap().chain_head_sha256.is_some());
    }
}
