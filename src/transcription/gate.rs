//! # Concurrency Gate
//!
//! Limits how many engine processes run at the same time. Whisper holds a
//! full model in memory per process, so even a handful of parallel jobs can
//! exhaust a small host.
//!
//! ## Admission Rules:
//! - At most `capacity` jobs hold a [`JobSlot`] at any instant
//! - Waiting jobs are admitted in arrival order (tokio's semaphore is FIFO)
//! - A wait aborted by cancellation never consumes a slot
//! - Slots are returned by dropping the [`JobSlot`], so every exit path of
//!   the holder (including a panic) gives the slot back exactly once

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Why a slot could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// The caller's cancellation token fired while waiting
    Cancelled,
    /// The gate was closed during shutdown
    Closed,
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateError::Cancelled => write!(f, "Cancelled while waiting for a job slot"),
            GateError::Closed => write!(f, "Job gate is closed"),
        }
    }
}

impl std::error::Error for GateError {}

/// Counting admission control for transcription jobs.
///
/// Cheap to clone; clones share the same slots.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    waiting: Arc<AtomicUsize>,
}

/// Exclusive permit to run one job. Released on drop.
#[derive(Debug)]
pub struct JobSlot {
    _permit: OwnedSemaphorePermit,
}

impl JobSlot {
    /// Give the slot back explicitly. Equivalent to dropping it.
    pub fn release(self) {}
}

/// Decrements the waiting counter however the wait ends.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyGate {
    /// Create a gate admitting `capacity` concurrent jobs.
    ///
    /// A capacity of zero is raised to one; config validation rejects it
    /// before this point.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot, or until `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<JobSlot, GateError> {
        if cancel.is_cancelled() {
            return Err(GateError::Cancelled);
        }

        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitingGuard(&self.waiting);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GateError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => Ok(JobSlot { _permit: permit }),
                Err(_) => Err(GateError::Closed),
            },
        }
    }

    /// Refuse all further admissions. Held slots stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits().min(self.capacity)
    }

    /// Number of callers blocked in [`ConcurrencyGate::acquire`].
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}
