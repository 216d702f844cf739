//! Cancellation and stop-cause tracking.
//!
//! The cancel verb is best-effort and idempotent: signaling an unknown or
//! already-finished job succeeds without error, which spares the host from
//! distinguishing "already gone" from "gone because we asked".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Why a running job was asked to stop. The first cause to trip wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// A cancel request arrived.
    Canceled,
    /// The overall wall-clock timeout elapsed.
    TimedOut,
    /// The lease TTL elapsed.
    LeaseExpired,
    /// The transport session died mid-run.
    SessionLost,
}

/// Shared stop flag for one running job.
#[derive(Debug)]
pub struct StopState {
    flag: AtomicBool,
    cause: Mutex<Option<StopCause>>,
}

impl StopState {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            cause: Mutex::new(None),
        }
    }

    /// Trip the stop flag with a cause. Later causes are ignored.
    pub fn trip(&self, cause: StopCause) {
        let mut slot = self.cause.lock().unwrap();
        if slot.is_none() {
            *slot = Some(cause);
            self.flag.store(true, Ordering::SeqCst);
        }
    }

    /// Whether the job has been asked to stop.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The winning stop cause, if any.
    pub fn cause(&self) -> Option<StopCause> {
        *self.cause.lock().unwrap()
    }
}

impl Default for StopState {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of active jobs, shared by all sessions of one worker.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<StopState>>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an active job; returns its stop handle.
    pub fn register(&self, job_id: &str) -> Arc<StopState> {
        let state = Arc::new(StopState::new());
        self.inner
            .lock()
            .unwrap()
            .insert(job_id.to_string(), state.clone());
        state
    }

    /// Remove a finished job.
    pub fn unregister(&self, job_id: &str) {
        self.inner.lock().unwrap().remove(job_id);
    }

    /// Request cancellation. Returns true if an active job was signaled;
    /// unknown jobs return false but the operation still counts as success.
    pub fn request(&self, job_id: &str) -> bool {
        match self.inner.lock().unwrap().get(job_id) {
            Some(state) => {
                state.trip(StopCause::Canceled);
                true
            }
            None => false,
        }
    }

    /// Number of registered (active) jobs.
    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
