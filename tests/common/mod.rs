//! Shared helpers for integration tests: an in-process transport backed by
//! a real worker harness, and a canned transport for scripted streams.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use relay_exec::host::transport::{Transport, TransportError};
use relay_protocol::envelope::{RpcRequest, RpcResponse};
use relay_protocol::request::{CancelResponse, Load, ProbeCapabilities};
use relay_worker::pipe::session_pipe;
use relay_worker::{Harness, WorkerConfig};

/// Worker config tuned for tests: temp work root, millisecond cadences.
pub fn worker_config(work_root: &Path) -> WorkerConfig {
    WorkerConfig {
        work_root: work_root.to_path_buf(),
        queue_interval: Duration::from_millis(20),
        kill_grace: Duration::from_millis(200),
        ..WorkerConfig::default()
    }
}

/// Transport running every session against a shared in-process harness.
pub struct LocalTransport {
    harness: Arc<Harness>,
}

impl LocalTransport {
    pub fn new(harness: Arc<Harness>) -> Self {
        Self { harness }
    }

    pub fn harness(&self) -> &Harness {
        &self.harness
    }

    /// Open a session: the returned stream carries the worker's output and
    /// holds the host's request channel open, so dropping it is what the
    /// worker observes as host loss.
    fn session(&self, request: &RpcRequest) -> Result<LiveStream, TransportError> {
        let line = serde_json::to_string(request)?;
        let (mut host_in, worker_in) = session_pipe();
        let (mut worker_out, host_out) = session_pipe();
        host_in.write_all(format!("{}\n", line).as_bytes())?;

        let harness = self.harness.clone();
        thread::spawn(move || {
            let _ = harness.run_session(BufReader::new(worker_in), &mut worker_out);
        });
        Ok(LiveStream {
            reader: BufReader::new(host_out),
            _host_side: host_in,
        })
    }
}

/// Worker output stream that keeps the host's request channel open.
pub struct LiveStream {
    reader: BufReader<relay_worker::pipe::PipeReader>,
    _host_side: relay_worker::pipe::PipeWriter,
}

impl Read for LiveStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl BufRead for LiveStream {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt)
    }
}

impl Transport for LocalTransport {
    fn call(&self, request: &RpcRequest) -> Result<RpcResponse, TransportError> {
        let mut session = self.session(request)?;
        let mut line = String::new();
        session.read_line(&mut line)?;
        if line.is_empty() {
            return Err(TransportError::Protocol(
                "worker closed the session without a response".to_string(),
            ));
        }
        Ok(serde_json::from_str(&line)?)
    }

    fn open_run(&self, request: &RpcRequest) -> Result<Box<dyn BufRead + Send>, TransportError> {
        Ok(Box::new(self.session(request)?))
    }
}

/// Capabilities descriptor for canned transports.
pub fn canned_capabilities() -> ProbeCapabilities {
    ProbeCapabilities {
        protocol_min: 1,
        protocol_max: 1,
        contract_min: 1,
        contract_max: 1,
        harness_version: "0.1.0".to_string(),
        features: vec!["run".to_string(), "cancel".to_string()],
        load: Load {
            active_jobs: 0,
            queued_jobs: 0,
            max_concurrent_jobs: 1,
        },
        work_root: "/tmp/relay-worker".to_string(),
    }
}

/// Transport that answers probe/cancel from canned data and serves a fixed
/// byte stream for run. Lets tests script truncated or corrupt streams.
pub struct CannedTransport {
    pub stream: Vec<u8>,
}

impl CannedTransport {
    pub fn new(stream: Vec<u8>) -> Self {
        Self { stream }
    }
}

impl Transport for CannedTransport {
    fn call(&self, request: &RpcRequest) -> Result<RpcResponse, TransportError> {
        let payload = if request.op == "probe" {
            serde_json::to_value(canned_capabilities())?
        } else {
            serde_json::to_value(CancelResponse {
                job_id: "unknown".to_string(),
                acknowledged: false,
            })?
        };
        Ok(RpcResponse::success(
            request.protocol_version,
            request.request_id.clone(),
            payload,
        ))
    }

    fn open_run(&self, _request: &RpcRequest) -> Result<Box<dyn BufRead + Send>, TransportError> {
        Ok(Box::new(Cursor::new(self.stream.clone())))
    }
}

/// Read a committed job's events.jsonl back as parsed events.
pub fn read_event_log(job_dir: &Path) -> Vec<relay_protocol::event::Event> {
    let file = std::fs::File::open(job_dir.join("events.jsonl")).expect("events.jsonl present");
    let mut events = Vec::new();
    let mut content = String::new();
    BufReader::new(file)
        .read_to_string(&mut content)
        .expect("readable event log");
    for line in content.lines() {
        events.push(serde_json::from_str(line).expect("valid event line"));
    }
    events
}
