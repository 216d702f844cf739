//! Event stream records.
//!
//! A running job produces an ordered stream of events. The first event is
//! always `hello`, the last is always `complete`, and `sequence` values are
//! contiguous from 1. The `complete` payload is the terminal record: the
//! single source of truth for a job's outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Event types, in the order they normally appear in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Stream opener; echoes protocol and job identity.
    Hello,
    /// Waiting for a lease; carries best-effort queue position.
    Queued,
    /// Lease granted; backend execution may begin.
    LeaseAcquired,
    /// One line of backend output.
    Log,
    /// Backend exited; artifacts are being gathered.
    Collecting,
    /// Terminal record; always the last event.
    Complete,
}

/// Terminal outcome states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// The authoritative outcome for a job, carried by the `complete` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalRecord {
    /// Backend exit code, when one exists.
    pub exit_code: Option<i32>,
    /// Terminal state.
    pub state: JobOutcome,
    /// Stable error code, or null for a plain backend failure/success.
    pub error_code: Option<ErrorCode>,
    /// True only when the host fabricated this record locally because no
    /// harness-reported terminal record arrived. Harness records always
    /// carry false.
    #[serde(default)]
    pub host_synthesized: bool,
}

impl TerminalRecord {
    /// A successful completion with the given exit code.
    pub fn succeeded(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            state: JobOutcome::Succeeded,
            error_code: None,
            host_synthesized: false,
        }
    }

    /// A failure, optionally attributed to a stable error code.
    pub fn failed(exit_code: Option<i32>, error_code: Option<ErrorCode>) -> Self {
        Self {
            exit_code,
            state: JobOutcome::Failed,
            error_code,
            host_synthesized: false,
        }
    }

    /// A cancellation reported by the harness.
    pub fn canceled() -> Self {
        Self {
            exit_code: None,
            state: JobOutcome::Canceled,
            error_code: Some(ErrorCode::Canceled),
            host_synthesized: false,
        }
    }

    /// A wall-clock timeout reported by the harness.
    pub fn timed_out() -> Self {
        Self {
            exit_code: None,
            state: JobOutcome::TimedOut,
            error_code: Some(ErrorCode::Timeout),
            host_synthesized: false,
        }
    }

    /// Mark this record as fabricated host-side.
    pub fn synthesized(mut self) -> Self {
        self.host_synthesized = true;
        self
    }
}

/// One record in a job's event stream.
///
/// Kind-specific fields are optional and omitted when absent; every event
/// carries the `{type, timestamp, sequence, job_id}` envelope. Sequence
/// numbers are assigned by the writer, starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// When the event was produced (UTC, RFC 3339).
    pub timestamp: DateTime<Utc>,

    /// Position in the stream; contiguous from 1.
    pub sequence: u64,

    /// Job this stream belongs to.
    pub job_id: String,

    /// Protocol version in effect (hello only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<i32>,

    /// Parent run identity (hello only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Attempt number (hello only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Whether the job entered the wait queue (hello only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued: Option<bool>,

    /// Best-effort position in the wait queue (queued only, 1-based).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,

    /// Granted lease TTL in seconds (lease_acquired only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_ttl_seconds: Option<u64>,

    /// One line of backend output (log only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,

    /// Terminal record (complete only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TerminalRecord>,

    /// Integrity chain: digest of the previous event, or the zero seed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_event_sha256: Option<String>,

    /// Integrity chain: digest of this event (computed over the record
    /// without this field).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_sha256: Option<String>,

    /// Integrity chain head over all pre-terminal events (complete only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_head_sha256: Option<String>,
}

impl Event {
    fn base(kind: EventKind, job_id: &str) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            sequence: 0,
            job_id: job_id.to_string(),
            protocol_version: None,
            run_id: None,
            attempt: None,
            queued: None,
            queue_position: None,
            lease_ttl_seconds: None,
            line: None,
            terminal: None,
            prev_event_sha256: None,
            event_sha256: None,
            chain_head_sha256: None,
        }
    }

    /// Stream opener. `queued` signals whether the job must wait for a lease.
    pub fn hello(job_id: &str, run_id: &str, attempt: u32, protocol_version: i32, queued: bool) -> Self {
        let mut event = Self::base(EventKind::Hello, job_id);
        event.protocol_version = Some(protocol_version);
        event.run_id = Some(run_id.to_string());
        event.attempt = Some(attempt);
        event.queued = Some(queued);
        event
    }

    /// Periodic wait notification with a 1-based queue position.
    pub fn queued(job_id: &str, queue_position: u32) -> Self {
        let mut event = Self::base(EventKind::Queued, job_id);
        event.queue_position = Some(queue_position);
        event
    }

    /// Lease granted.
    pub fn lease_acquired(job_id: &str, lease_ttl_seconds: u64) -> Self {
        let mut event = Self::base(EventKind::LeaseAcquired, job_id);
        event.lease_ttl_seconds = Some(lease_ttl_seconds);
        event
    }

    /// One line of backend output.
    pub fn log(job_id: &str, line: impl Into<String>) -> Self {
        let mut event = Self::base(EventKind::Log, job_id);
        event.line = Some(line.into());
        event
    }

    /// Backend exited; artifact collection started.
    pub fn collecting(job_id: &str) -> Self {
        Self::base(EventKind::Collecting, job_id)
    }

    /// Terminal event.
    pub fn complete(job_id: &str, terminal: TerminalRecord) -> Self {
        let mut event = Self::base(EventKind::Complete, job_id);
        event.terminal = Some(terminal);
        event
    }

    /// Whether this is the terminal event.
    pub fn is_terminal(&self) -> bool {
        self.kind == EventKind::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&EventKind::LeaseAcquired).unwrap(),
            "\"lease_acquired\""
        );
        assert_eq!(
            serde_json::to_string(&JobOutcome::TimedOut).unwrap(),
            "\"timed_out\""
        );
    }

    #[test]
    fn test_hello_carries_identity() {
        let event = Event::hello("job-1", "run-abc", 2, 1, true);
        assert_eq!(event.kind, EventKind::Hello);
        assert_eq!(event.run_id.as_deref(), Some("run-abc"));
        assert_eq!(event.attempt, Some(2));
        assert_eq!(event.queued, Some(true));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let event = Event::collecting("job-1");
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("queue_position"));
        assert!(!json.contains("terminal"));
        assert!(json.contains("\"type\":\"collecting\""));
    }

    #[test]
    fn test_terminal_roundtrip() {
        let event = Event::complete("job-1", TerminalRecord::failed(Some(65), None));
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        let terminal = parsed.terminal.unwrap();
        assert_eq!(terminal.state, JobOutcome::Failed);
        assert_eq!(terminal.exit_code, Some(65));
        assert!(terminal.error_code.is_none());
        assert!(!terminal.host_synthesized);
    }

    #[test]
    fn test_host_synthesized_defaults_false() {
        let json = r#"{"exit_code":null,"state":"failed","error_code":"event_stream_incomplete"}"#;
        let record: TerminalRecord = serde_json::from_str(json).unwrap();
        assert!(!record.host_synthesized);
    }

    #[test]
    fn test_synthesized_marker() {
        let record = TerminalRecord::failed(None, Some(ErrorCode::EventStreamIncomplete)).synthesized();
        assert!(record.host_synthesized);
        assert_eq!(record.error_code, Some(ErrorCode::EventStreamIncomplete));
    }
}
