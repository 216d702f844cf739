//! Relay worker harness.
//!
//! Implements the worker side of the protocol: a stdio session exposing
//! `probe`, `run`, and `cancel`, the local lease manager that owns bounded
//! concurrency, backend dispatch, and the result-bundle commit.

pub mod backend;
pub mod cancel;
pub mod config;
pub mod harness;
pub mod lease;
pub mod paths;
pub mod pipe;

pub use backend::{Backend, BackendError, BackendExit, ExecContext, MockBackend, ProcessBackend};
pub use cancel::{CancelRegistry, StopCause, StopState};
pub use config::WorkerConfig;
pub use harness::Harness;
pub use lease::{Lease, LeaseAttempt, LeaseManager};
pub use paths::{JobWorkspace, PathError};
