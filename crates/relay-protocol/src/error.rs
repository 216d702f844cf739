//! Error codes for the RPC protocol and terminal records.
//!
//! Codes are stable snake_case strings used for automation; they appear in
//! RPC error responses and in the `error_code` field of terminal records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error codes surfaced on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed JSON, missing required fields, or invalid field values.
    InvalidRequest,
    /// Protocol version is outside the supported range.
    UnsupportedProtocol,
    /// Unknown operation requested.
    UnknownOperation,
    /// The job lease expired or session liveness was lost.
    LeaseExpired,
    /// No lease could be granted before the deadline.
    LeaseUnavailable,
    /// The worker could not be reached over the transport.
    WorkerUnreachable,
    /// An event line failed parsing or violated framing invariants.
    EventStreamCorrupt,
    /// The stream ended without a valid terminal record (host-fabricated cause).
    EventStreamIncomplete,
    /// A supplied path escaped the configured roots.
    PathOutOfBounds,
    /// Overall wall-clock timeout exceeded.
    Timeout,
    /// The job was canceled.
    Canceled,
}

impl ErrorCode {
    /// Whether a failed attempt with this code may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LeaseExpired | Self::LeaseUnavailable | Self::WorkerUnreachable
        )
    }

    /// The stable wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::UnsupportedProtocol => "unsupported_protocol",
            Self::UnknownOperation => "unknown_operation",
            Self::LeaseExpired => "lease_expired",
            Self::LeaseUnavailable => "lease_unavailable",
            Self::WorkerUnreachable => "worker_unreachable",
            Self::EventStreamCorrupt => "event_stream_corrupt",
            Self::EventStreamIncomplete => "event_stream_incomplete",
            Self::PathOutOfBounds => "path_out_of_bounds",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RPC error response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code from the registry.
    pub code: ErrorCode,
    /// Human-readable, single-line error message.
    /// Must not contain secrets, filesystem paths outside job dirs, or stack traces.
    pub message: String,
    /// Optional machine-readable details (failing field, expected vs actual values).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    /// Create a new RPC error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create a new RPC error with additional data.
    pub fn with_data(code: ErrorCode, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Create an invalid_request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Create an unsupported_protocol error.
    pub fn unsupported_protocol(version: i32, min: i32, max: i32) -> Self {
        Self::with_data(
            ErrorCode::UnsupportedProtocol,
            format!(
                "protocol_version {} is outside supported range [{}, {}]",
                version, min, max
            ),
            serde_json::json!({
                "requested": version,
                "min": min,
                "max": max
            }),
        )
    }

    /// Create an unknown_operation error.
    pub fn unknown_operation(op: &str) -> Self {
        Self::with_data(
            ErrorCode::UnknownOperation,
            format!("unknown operation: {}", op),
            serde_json::json!({ "op": op }),
        )
    }

    /// Create a path_out_of_bounds error.
    pub fn path_out_of_bounds(hint: &str) -> Self {
        Self::with_data(
            ErrorCode::PathOutOfBounds,
            "supplied path escaped the configured roots",
            serde_json::json!({ "hint": hint }),
        )
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}
