//! Relay Protocol Types
//!
//! Defines the host↔worker wire protocol: the JSON RPC envelope for
//! `probe`/`cancel`, the job request object for `run`, the NDJSON event
//! stream codec, deterministic identity hashing, and the two-phase artifact
//! commit protocol shared by both sides.

pub mod canon;
pub mod codec;
pub mod commit;
pub mod envelope;
pub mod error;
pub mod event;
pub mod request;

pub use codec::{CodecError, EventReader, EventWriter};
pub use envelope::{Operation, RpcRequest, RpcResponse};
pub use error::{ErrorCode, RpcError};
pub use event::{Event, EventKind, JobOutcome, TerminalRecord};
pub use request::{CancelRequest, CancelResponse, ConfigResolved, JobPaths, JobRequest, Load, ProbeCapabilities};

/// Protocol version used for probe requests (sentinel value).
pub const PROTOCOL_VERSION_PROBE: i32 = 0;

/// Minimum protocol version supported by this implementation.
pub const PROTOCOL_MIN: i32 = 1;

/// Maximum protocol version supported by this implementation.
pub const PROTOCOL_MAX: i32 = 1;

/// Contract version stamped into hashable config inputs.
pub const CONTRACT_VERSION: u32 = 1;

/// Current harness/lane version string.
pub const LANE_VERSION: &str = "0.1.0";
