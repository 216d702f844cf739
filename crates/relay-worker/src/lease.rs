//! Lease manager.
//!
//! The worker is the sole authority on lease grant and queueing: it has
//! perfect local visibility into what it is actually running. A lease is a
//! TTL-bounded grant for one job; waiters form a FIFO queue with best-effort
//! positions. TTL enforcement happens in the run loop, which always produces
//! a terminal event; the manager only frees capacity held by expired grants.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A concurrency grant for one job.
#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: String,
    pub job_id: String,
    pub acquired_at: Instant,
    pub ttl: Duration,
}

impl Lease {
    /// Check if this lease has outlived its TTL.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() > self.ttl
    }
}

/// Outcome of a lease acquisition attempt.
#[derive(Debug)]
pub enum LeaseAttempt {
    /// The lease was granted.
    Acquired(Lease),
    /// The worker is saturated; the job holds a 1-based queue position.
    Queued { position: usize },
}

#[derive(Debug)]
struct Inner {
    active: HashMap<String, Lease>,
    waiters: VecDeque<String>,
    max_concurrent: usize,
    id_counter: u64,
}

/// Thread-safe lease manager shared by all sessions of one worker.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    inner: Arc<Mutex<Inner>>,
}

impl LeaseManager {
    /// Create a manager with the given concurrency bound.
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                active: HashMap::new(),
                waiters: VecDeque::new(),
                max_concurrent: max_concurrent.max(1) as usize,
                id_counter: 0,
            })),
        }
    }

    /// Attempt to acquire a lease for `job_id`.
    ///
    /// Grants are FIFO: a saturated attempt enqueues the job and reports its
    /// position; once capacity frees, only the head of the queue is granted.
    pub fn try_acquire(&self, job_id: &str, ttl: Duration) -> LeaseAttempt {
        let mut inner = self.inner.lock().unwrap();
        inner.active.retain(|_, lease| !lease.is_expired());

        let at_capacity = inner.active.len() >= inner.max_concurrent;
        let is_front = inner
            .waiters
            .front()
            .map(|front| front == job_id)
            .unwrap_or(true);

        if !at_capacity && is_front {
            if inner.waiters.front().map(|f| f == job_id).unwrap_or(false) {
                inner.waiters.pop_front();
            }
            inner.id_counter += 1;
            let lease = Lease {
                lease_id: format!("lease-{:08x}", inner.id_counter),
                job_id: job_id.to_string(),
                acquired_at: Instant::now(),
                ttl,
            };
            inner.active.insert(lease.lease_id.clone(), lease.clone());
            return LeaseAttempt::Acquired(lease);
        }

        if !inner.waiters.iter().any(|waiter| waiter == job_id) {
            inner.waiters.push_back(job_id.to_string());
        }
        let position = inner
            .waiters
            .iter()
            .position(|waiter| waiter == job_id)
            .map(|i| i + 1)
            .unwrap_or(1);
        LeaseAttempt::Queued { position }
    }

    /// Release a lease. Idempotent: releasing an unknown or already-released
    /// lease returns false without error.
    pub fn release(&self, lease_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.active.remove(lease_id).is_some()
    }

    /// Remove a job from the wait queue (it gave up before being granted).
    pub fn abandon(&self, job_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.waiters.retain(|waiter| waiter != job_id);
    }

    /// Number of active (unexpired) leases.
    pub fn active_count(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.active.retain(|_, lease| !lease.is_expired());
        inner.active.len()
    }

    /// Number of jobs waiting for a lease.
    pub fn queued_count(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }

    /// Whether a new arrival would have to wait.
    pub fn is_saturated(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.active.retain(|_, lease| !lease.is_expired());
        inner.active.len() >= inner.max_concurrent || !inner.waiters.is_empty()
    }

    /// Wrap a granted lease in a release-on-drop guard.
    pub fn guard(&self, lease: Lease) -> LeaseGuard {
        LeaseGuard {
            manager: self.clone(),
            lease,
        }
    }
}

/// Releases its lease when dropped, so every exit path frees capacity.
pub struct LeaseGuard {
    manager: LeaseManager,
    lease: Lease,
}

impl LeaseGuard {
    /// The underlying lease.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.manager.release(&self.lease.lease_id);
    }
}
