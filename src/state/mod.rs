//! Host-side job state machine.
//!
//! The host's view of a job is driven exclusively by consumed events; it
//! never invents state by polling. If the stream ends without a valid
//! terminal record, the machine is forced into `failed` with a record
//! explicitly tagged `host_synthesized`, so a fabrication is never confused
//! with a harness-reported outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use relay_protocol::error::ErrorCode;
use relay_protocol::event::{Event, EventKind, JobOutcome, TerminalRecord};

/// Host-side job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostJobState {
    /// Job object exists; no events consumed yet.
    Created,
    /// Hello received; worker is preparing.
    Staging,
    /// Waiting for a lease on the worker.
    Queued,
    /// Lease granted; backend executing.
    Running,
    /// Backend exited; worker gathering artifacts.
    Collecting,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

impl HostJobState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::TimedOut
        )
    }

    /// The terminal state for a reported outcome.
    pub fn from_outcome(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Succeeded => Self::Succeeded,
            JobOutcome::Failed => Self::Failed,
            JobOutcome::Canceled => Self::Canceled,
            JobOutcome::TimedOut => Self::TimedOut,
        }
    }

    /// Check if a transition to `target` is valid.
    pub fn can_transition_to(&self, target: HostJobState) -> bool {
        if target.is_terminal() {
            // Any live state can reach a terminal via a complete event.
            return !self.is_terminal();
        }
        matches!(
            (self, target),
            (Self::Created, Self::Staging)
                | (Self::Created, Self::Queued)
                | (Self::Staging, Self::Queued)
                | (Self::Staging, Self::Running)
                | (Self::Queued, Self::Queued)
                | (Self::Queued, Self::Running)
                | (Self::Running, Self::Collecting)
        )
    }
}

/// State machine errors: these indicate a protocol defect, not a job failure.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: HostJobState, to: HostJobState },

    #[error("complete event missing its terminal record")]
    MissingTerminalRecord,

    #[error("event for job '{got}' fed to machine for job '{expected}'")]
    WrongJob { expected: String, got: String },

    #[error("job already reached terminal state {0:?}")]
    AlreadyTerminal(HostJobState),
}

/// Tracks one job attempt through its lifecycle.
#[derive(Debug, Clone)]
pub struct JobStateMachine {
    job_id: String,
    run_id: String,
    attempt: u32,
    state: HostJobState,
    terminal: Option<TerminalRecord>,
    queue_position: Option<u32>,
    events_observed: u64,
    updated_at: DateTime<Utc>,
}

impl JobStateMachine {
    /// Create the machine for one job attempt.
    pub fn new(job_id: impl Into<String>, run_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            job_id: job_id.into(),
            run_id: run_id.into(),
            attempt,
            state: HostJobState::Created,
            terminal: None,
            queue_position: None,
            events_observed: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> HostJobState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The terminal record, once one exists (reported or synthesized).
    pub fn terminal(&self) -> Option<&TerminalRecord> {
        self.terminal.as_ref()
    }

    /// Last reported queue position, if the job waited.
    pub fn queue_position(&self) -> Option<u32> {
        self.queue_position
    }

    /// Number of events consumed.
    pub fn events_observed(&self) -> u64 {
        self.events_observed
    }

    /// When the machine last changed.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Consume one event and transition accordingly.
    pub fn apply(&mut self, event: &Event) -> Result<HostJobState, StateError> {
        if event.job_id != self.job_id {
            return Err(StateError::WrongJob {
                expected: self.job_id.clone(),
                got: event.job_id.clone(),
            });
        }
        if self.state.is_terminal() {
            return Err(StateError::AlreadyTerminal(self.state));
        }

        let target = match event.kind {
            EventKind::Hello => {
                if event.queued == Some(true) {
                    HostJobState::Queued
                } else {
                    HostJobState::Staging
                }
            }
            EventKind::Queued => {
                self.queue_position = event.queue_position;
                HostJobState::Queued
            }
            EventKind::LeaseAcquired => HostJobState::Running,
            EventKind::Log => {
                // Output lines carry no transition.
                self.events_observed += 1;
                self.updated_at = Utc::now();
                return Ok(self.state);
            }
            EventKind::Collecting => HostJobState::Collecting,
            EventKind::Complete => {
                let record = event
                    .terminal
                    .as_ref()
                    .ok_or(StateError::MissingTerminalRecord)?;
                HostJobState::from_outcome(record.state)
            }
        };

        if !self.state.can_transition_to(target) {
            return Err(StateError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        if event.kind == EventKind::Complete {
            self.terminal = event.terminal.clone();
        }
        self.events_observed += 1;
        self.updated_at = Utc::now();
        Ok(self.state)
    }

    /// Fabricate a terminal record locally. The record is tagged
    /// `host_synthesized` and the transition bypasses the event table.
    pub fn synthesize(&mut self, record: TerminalRecord) -> Result<&TerminalRecord, StateError> {
        if self.state.is_terminal() {
            return Err(StateError::AlreadyTerminal(self.state));
        }
        let record = record.synthesized();
        self.state = HostJobState::from_outcome(record.state);
        self.terminal = Some(record);
        self.updated_at = Utc::now();
        Ok(self.terminal.as_ref().expect("terminal record just set"))
    }

    /// Force the terminal state for a stream that ended without a valid
    /// `complete` event.
    pub fn force_incomplete(&mut self) -> Result<&TerminalRecord, StateError> {
        self.synthesize(TerminalRecord::failed(
            None,
            Some(ErrorCode::EventStreamIncomplete),
        ))
    }

    /// Force the terminal state for a corrupt stream.
    pub fn force_corrupt(&mut self) -> Result<&TerminalRecord, StateError> {
        self.synthesize(TerminalRecord::failed(
            None,
            Some(ErrorCode::EventStreamCorrupt),
        ))
    }
}
