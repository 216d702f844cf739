//! Signal-driven cancellation.
//!
//! The first interrupt requests a best-effort cancel; the orchestrator then
//! keeps waiting for a real terminal record. A second interrupt abandons
//! that wait, after which the caller should synthesize and exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Coordinates interrupt signals with the orchestrator's cancel flag.
pub struct CancellationCoordinator {
    cancel: Arc<AtomicBool>,
    abandon: Arc<AtomicBool>,
}

impl CancellationCoordinator {
    /// Create a coordinator tripping the given cancel flag.
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            cancel,
            abandon: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install the interrupt handler.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let cancel = self.cancel.clone();
        let abandon = self.abandon.clone();
        ctrlc::set_handler(move || {
            if cancel.swap(true, Ordering::SeqCst) {
                abandon.store(true, Ordering::SeqCst);
            } else {
                eprintln!("cancel requested; interrupt again to stop waiting");
            }
        })
    }

    /// Trip the cancel flag without a signal (tests, timeouts).
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Whether the user gave up waiting for a terminal record.
    pub fn abandoned(&self) -> bool {
        self.abandon.load(Ordering::SeqCst)
    }
}
