//! Relay - remote job-execution lane
//!
//! This crate implements the host side of relay: a system that routes a
//! build/test action from a control host to a single designated worker,
//! executes it under a versioned stdio protocol, and returns schema-stable,
//! verifiable results.

pub mod host;
pub mod identity;
pub mod inventory;
pub mod orchestrator;
pub mod signal;
pub mod state;
pub mod summary;

pub use host::transport::{CommandTransport, SshConfig, Transport, TransportError};
pub use host::{HostError, RpcClient};
pub use identity::{compute_identity, hash_source_tree, ConfigInputs, RunIdentity, StepInputs};
pub use inventory::{WorkerEntry, WorkerInventory};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunPlan, RunResult};
pub use state::{HostJobState, JobStateMachine};
