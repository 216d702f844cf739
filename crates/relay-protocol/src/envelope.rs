//! RPC envelope types.
//!
//! One transport session carries exactly one JSON request: `probe` and
//! `cancel` reply with a single response envelope; `run` replies with an
//! NDJSON event stream instead.

use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// Supported RPC operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Returns capabilities and load; no job side effects.
    /// MUST accept protocol_version: 0 exclusively for this op.
    Probe,
    /// Consumes one job request and produces an event stream ending in `complete`.
    Run,
    /// Best-effort termination; idempotent on unknown or expired jobs.
    Cancel,
}

impl Operation {
    /// Returns true if this operation accepts protocol_version: 0.
    pub fn accepts_version_zero(&self) -> bool {
        matches!(self, Operation::Probe)
    }

    /// The wire name of this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Probe => "probe",
            Operation::Run => "run",
            Operation::Cancel => "cancel",
        }
    }
}

/// RPC request envelope.
///
/// `op` stays a plain string on the wire so an unknown operation can be
/// answered with `unknown_operation` instead of a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Protocol version (selected by host after probe).
    /// For probe requests, this MUST be 0.
    pub protocol_version: i32,
    /// Operation name.
    pub op: String,
    /// Caller-chosen request ID for correlation.
    pub request_id: String,
    /// Operation-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RpcRequest {
    /// Build a request for a known operation.
    pub fn new(
        protocol_version: i32,
        op: Operation,
        request_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            protocol_version,
            op: op.as_str().to_string(),
            request_id: request_id.into(),
            payload,
        }
    }
}

/// RPC response envelope (probe and cancel only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Protocol version (echoed from request, or 0 for probe).
    pub protocol_version: i32,
    /// Request ID echoed from the request.
    pub request_id: String,
    /// Whether the operation succeeded.
    pub ok: bool,
    /// Success payload (present when ok=true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Error details (present when ok=false).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Create a success response.
    pub fn success(protocol_version: i32, request_id: String, payload: serde_json::Value) -> Self {
        Self {
            protocol_version,
            request_id,
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(protocol_version: i32, request_id: String, error: RpcError) -> Self {
        Self {
            protocol_version,
            request_id,
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}
