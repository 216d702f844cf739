//! NDJSON event stream codec.
//!
//! The writer emits exactly one newline-terminated JSON object per event and
//! owns sequence assignment, so a partial event is never representable. The
//! reader is a lazy iterator that enforces the framing invariants: first
//! event `hello`, contiguous sequence from 1, single `complete` terminator.
//!
//! A final line lacking its newline at end-of-stream is treated as "not yet
//! a complete event" rather than an error, so a reader racing the writer
//! stops cleanly. Any line that fails JSON parsing is fatal to the stream
//! and surfaces as a distinguishable corrupt condition.
//!
//! Integrity mode adds a SHA-256 hash chain: each event carries
//! `prev_event_sha256` and `event_sha256`, seeded with 64 zero hex chars;
//! the terminal event additionally records the chain head over all
//! pre-terminal events.

use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::canon::{self, CanonError};
use crate::error::ErrorCode;
use crate::event::{Event, EventKind};

/// Seed for the event hash chain: 64 zero hex chars.
pub const CHAIN_SEED: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors from the event codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JCS canonicalization error: {0}")]
    Canon(#[from] CanonError),

    #[error("first event in a stream must be hello, got {0:?}")]
    MissingHello(EventKind),

    #[error("event emitted after terminal complete")]
    EventAfterTerminal,

    #[error("event job_id '{got}' does not match stream job_id '{expected}'")]
    JobIdMismatch { expected: String, got: String },

    #[error("event stream corrupt: {0}")]
    StreamCorrupt(String),
}

impl CodecError {
    /// The stable error code for surfacing codec failures.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::EventStreamCorrupt
    }
}

/// Compute the integrity digest of an event: SHA-256 over the JCS form of
/// the record with the `event_sha256` field cleared.
fn event_digest(event: &Event) -> Result<String, CodecError> {
    let mut hashed = event.clone();
    hashed.event_sha256 = None;
    Ok(canon::sha256_hex(&canon::canonicalize(&hashed)?))
}

/// Writes a job's event stream, enforcing framing invariants.
pub struct EventWriter<W: Write> {
    out: W,
    job_id: String,
    next_sequence: u64,
    closed: bool,
    integrity: bool,
    chain: String,
}

impl<W: Write> EventWriter<W> {
    /// Create a writer for one job's stream.
    pub fn new(out: W, job_id: impl Into<String>, integrity: bool) -> Self {
        Self {
            out,
            job_id: job_id.into(),
            next_sequence: 1,
            closed: false,
            integrity,
            chain: CHAIN_SEED.to_string(),
        }
    }

    /// Emit one event. Assigns the sequence number (and chain fields in
    /// integrity mode), writes a single newline-terminated line, flushes,
    /// and returns the enriched record for local persistence.
    pub fn write(&mut self, mut event: Event) -> Result<Event, CodecError> {
        if self.closed {
            return Err(CodecError::EventAfterTerminal);
        }
        if self.next_sequence == 1 && event.kind != EventKind::Hello {
            return Err(CodecError::MissingHello(event.kind));
        }
        if event.job_id != self.job_id {
            return Err(CodecError::JobIdMismatch {
                expected: self.job_id.clone(),
                got: event.job_id,
            });
        }

        event.sequence = self.next_sequence;

        if self.integrity {
            event.prev_event_sha256 = Some(self.chain.clone());
            if event.is_terminal() {
                event.chain_head_sha256 = Some(self.chain.clone());
            }
            let digest = event_digest(&event)?;
            event.event_sha256 = Some(digest.clone());
            self.chain = digest;
        }

        let line = serde_json::to_string(&event)?;
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;

        self.next_sequence += 1;
        if event.is_terminal() {
            self.closed = true;
        }
        Ok(event)
    }

    /// Whether the terminal event has been written.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current head of the hash chain (the seed until an event is written).
    pub fn chain_head(&self) -> &str {
        &self.chain
    }
}

/// Reads a job's event stream as a lazy, finite, non-restartable iterator.
///
/// Yields `Ok(Event)` per valid record; a framing or parse violation yields
/// one `Err` and ends the stream. Iteration also ends at end-of-input or at
/// an unterminated final line; callers distinguish a clean stream via
/// [`EventReader::saw_complete`].
pub struct EventReader<R: BufRead> {
    input: R,
    verify_integrity: bool,
    expect_sequence: u64,
    job_id: Option<String>,
    chain: String,
    saw_complete: bool,
    incomplete_tail: bool,
    failed: bool,
}

impl<R: BufRead> EventReader<R> {
    /// Create a reader. With `verify_integrity`, every event must carry
    /// valid hash-chain fields.
    pub fn new(input: R, verify_integrity: bool) -> Self {
        Self {
            input,
            verify_integrity,
            expect_sequence: 1,
            job_id: None,
            chain: CHAIN_SEED.to_string(),
            saw_complete: false,
            incomplete_tail: false,
            failed: false,
        }
    }

    /// Whether a valid terminal `complete` event was observed.
    pub fn saw_complete(&self) -> bool {
        self.saw_complete
    }

    /// Whether the stream ended on a line without its trailing newline.
    pub fn incomplete_tail(&self) -> bool {
        self.incomplete_tail
    }

    fn corrupt(&mut self, reason: impl Into<String>) -> CodecError {
        self.failed = true;
        CodecError::StreamCorrupt(reason.into())
    }

    fn check(&mut self, event: &Event) -> Result<(), CodecError> {
        if self.expect_sequence == 1 && event.kind != EventKind::Hello {
            return Err(self.corrupt(format!("first event must be hello, got {:?}", event.kind)));
        }
        if event.sequence != self.expect_sequence {
            return Err(self.corrupt(format!(
                "sequence gap: expected {}, got {}",
                self.expect_sequence, event.sequence
            )));
        }
        if let Some(job_id) = &self.job_id {
            if *job_id != event.job_id {
                let reason =
                    format!("job_id changed mid-stream: '{}' then '{}'", job_id, event.job_id);
                return Err(self.corrupt(reason));
            }
        } else {
            self.job_id = Some(event.job_id.clone());
        }

        if self.verify_integrity || event.event_sha256.is_some() {
            let claimed = match (&event.prev_event_sha256, &event.event_sha256) {
                (Some(prev), Some(own)) => {
                    if *prev != self.chain {
                        return Err(self.corrupt(format!(
                            "hash chain broken at sequence {}: expected prev {}, got {}",
                            event.sequence, self.chain, prev
                        )));
                    }
                    own.clone()
                }
                _ => {
                    return Err(self.corrupt(format!(
                        "integrity fields missing at sequence {}",
                        event.sequence
                    )))
                }
            };
            let computed = match event_digest(event) {
                Ok(digest) => digest,
                Err(e) => return Err(self.corrupt(format!("digest failure: {}", e))),
            };
            if computed != claimed {
                return Err(self.corrupt(format!(
                    "event digest mismatch at sequence {}",
                    event.sequence
                )));
            }
            if event.is_terminal() {
                match &event.chain_head_sha256 {
                    Some(head) if *head == self.chain => {}
                    Some(_) => {
                        return Err(self.corrupt("terminal chain head does not match stream"))
                    }
                    None => return Err(self.corrupt("terminal event missing chain head")),
                }
            }
            self.chain = claimed;
        }

        Ok(())
    }
}

impl<R: BufRead> Iterator for EventReader<R> {
    type Item = Result<Event, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.saw_complete || self.incomplete_tail {
            return None;
        }

        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => {
                self.failed = true;
                return Some(Err(CodecError::Io(e)));
            }
        }

        if !line.ends_with('\n') {
            // Defensive tail handling: a writer may still be mid-line.
            self.incomplete_tail = true;
            return None;
        }

        let event: Event = match serde_json::from_str(line.trim_end()) {
            Ok(event) => event,
            Err(e) => return Some(Err(self.corrupt(format!("invalid JSON: {}", e)))),
        };

        if let Err(e) = self.check(&event) {
            return Some(Err(e));
        }

        self.expect_sequence += 1;
        if event.is_terminal() {
            self.saw_complete = true;
        }
        Some(Ok(event))
    }
}
