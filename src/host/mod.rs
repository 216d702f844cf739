//! Host-side RPC client.
//!
//! Wraps a [`Transport`] with request-id correlation, probe-time protocol
//! negotiation, cancel, and run-stream setup.

pub mod transport;

use std::io::BufRead;

use thiserror::Error;

use relay_protocol::codec::EventReader;
use relay_protocol::envelope::{Operation, RpcRequest};
use relay_protocol::error::RpcError;
use relay_protocol::request::{CancelRequest, CancelResponse, JobRequest, ProbeCapabilities};
use relay_protocol::{PROTOCOL_MAX, PROTOCOL_MIN, PROTOCOL_VERSION_PROBE};

use self::transport::{Transport, TransportError};

/// Host-side RPC errors.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("worker error: {0}")]
    Rpc(RpcError),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("no compatible protocol: host supports [{host_min}, {host_max}], worker supports [{worker_min}, {worker_max}]")]
    NoCompatibleProtocol {
        host_min: i32,
        host_max: i32,
        worker_min: i32,
        worker_max: i32,
    },
}

/// RPC client bound to one worker.
pub struct RpcClient {
    transport: Box<dyn Transport>,
    protocol_version: i32,
}

impl RpcClient {
    /// Create a client. The protocol version starts at the host minimum and
    /// is fixed by [`RpcClient::probe`].
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            protocol_version: PROTOCOL_MIN,
        }
    }

    /// The negotiated protocol version.
    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    /// Probe the worker and negotiate the protocol version: the highest
    /// version both sides support.
    pub fn probe(&mut self) -> Result<ProbeCapabilities, HostError> {
        let request = RpcRequest::new(
            PROTOCOL_VERSION_PROBE,
            Operation::Probe,
            request_id("probe"),
            serde_json::json!({}),
        );
        let response = self.transport.call(&request)?;
        if !response.ok {
            return Err(HostError::Rpc(response.error.unwrap_or_else(|| {
                RpcError::invalid_request("worker returned ok=false without error details")
            })));
        }
        let payload = response
            .payload
            .ok_or_else(|| HostError::MalformedResponse("probe response without payload".into()))?;
        let capabilities: ProbeCapabilities = serde_json::from_value(payload)
            .map_err(|e| HostError::MalformedResponse(format!("probe payload: {}", e)))?;

        let selected = PROTOCOL_MAX.min(capabilities.protocol_max);
        if selected < PROTOCOL_MIN.max(capabilities.protocol_min) {
            return Err(HostError::NoCompatibleProtocol {
                host_min: PROTOCOL_MIN,
                host_max: PROTOCOL_MAX,
                worker_min: capabilities.protocol_min,
                worker_max: capabilities.protocol_max,
            });
        }
        self.protocol_version = selected;
        Ok(capabilities)
    }

    /// Request best-effort cancellation of a job. Success on unknown jobs
    /// is part of the contract.
    pub fn cancel(&self, job_id: &str) -> Result<CancelResponse, HostError> {
        let request = RpcRequest::new(
            self.protocol_version,
            Operation::Cancel,
            request_id("cancel"),
            serde_json::to_value(CancelRequest {
                job_id: job_id.to_string(),
            })
            .map_err(|e| HostError::MalformedResponse(e.to_string()))?,
        );
        let response = self.transport.call(&request)?;
        if !response.ok {
            return Err(HostError::Rpc(response.error.unwrap_or_else(|| {
                RpcError::invalid_request("worker returned ok=false without error details")
            })));
        }
        let payload = response
            .payload
            .ok_or_else(|| HostError::MalformedResponse("cancel response without payload".into()))?;
        serde_json::from_value(payload)
            .map_err(|e| HostError::MalformedResponse(format!("cancel payload: {}", e)))
    }

    /// Start a run and return the lazy event stream.
    pub fn start_run(
        &self,
        job: &JobRequest,
    ) -> Result<EventReader<Box<dyn BufRead + Send>>, HostError> {
        let request = RpcRequest::new(
            self.protocol_version,
            Operation::Run,
            request_id("run"),
            serde_json::to_value(job).map_err(|e| HostError::MalformedResponse(e.to_string()))?,
        );
        let stream = self.transport.open_run(&request)?;
        Ok(EventReader::new(stream, job.integrity))
    }
}

/// Correlation id: operation name plus a random suffix.
fn request_id(op: &str) -> String {
    format!("{}-{}", op, uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::envelope::RpcResponse;
    use relay_protocol::request::Load;

    /// Canned transport for client unit tests.
    struct StaticTransport {
        response: RpcResponse,
    }

    impl Transport for StaticTransport {
        fn call(&self, _request: &RpcRequest) -> Result<RpcResponse, TransportError> {
            Ok(self.response.clone())
        }

        fn open_run(
            &self,
            _request: &RpcRequest,
        ) -> Result<Box<dyn BufRead + Send>, TransportError> {
            Err(TransportError::Protocol("not a run transport".to_string()))
        }
    }

    fn capabilities(min: i32, max: i32) -> ProbeCapabilities {
        ProbeCapabilities {
            protocol_min: min,
            protocol_max: max,
            contract_min: 1,
            contract_max: 1,
            harness_version: "0.1.0".to_string(),
            features: vec!["run".to_string()],
            load: Load {
                active_jobs: 0,
                queued_jobs: 0,
                max_concurrent_jobs: 1,
            },
            work_root: "/tmp/relay-worker".to_string(),
        }
    }

    #[test]
    fn test_probe_negotiates_version() {
        let response = RpcResponse::success(
            0,
            "req".to_string(),
            serde_json::to_value(capabilities(1, 3)).unwrap(),
        );
        let mut client = RpcClient::new(Box::new(StaticTransport { response }));
        client.probe().unwrap();
        assert_eq!(client.protocol_version(), PROTOCOL_MAX);
    }

    #[test]
    fn test_probe_rejects_disjoint_ranges() {
        let response = RpcResponse::success(
            0,
            "req".to_string(),
            serde_json::to_value(capabilities(5, 9)).unwrap(),
        );
        let mut client = RpcClient::new(Box::new(StaticTransport { response }));
        let err = client.probe().unwrap_err();
        assert!(matches!(err, HostError::NoCompatibleProtocol { .. }));
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(request_id("probe"), request_id("probe"));
        assert!(request_id("cancel").starts_with("cancel-"));
    }
}
