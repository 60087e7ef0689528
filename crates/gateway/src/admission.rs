//! Session admission.
//!
//! A process-wide semaphore caps concurrent sessions. A connection holds its
//! [`SessionPermit`] for its whole lifetime; dropping the permit frees the
//! slot on every exit path.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Admission failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// All session slots are taken.
    #[error("maximum connections reached ({limit})")]
    CapacityExceeded { limit: usize },

    /// The controller was shut down.
    #[error("admission closed")]
    Closed,
}

/// Enforces the concurrent session limit.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    slots: Arc<Semaphore>,
    limit: usize,
}

/// An occupied session slot.
#[derive(Debug)]
pub struct SessionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionController {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Claims a slot without waiting.
    pub fn try_admit(&self) -> Result<SessionPermit, AdmissionError> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => Ok(SessionPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => {
                Err(AdmissionError::CapacityExceeded { limit: self.limit })
            }
            Err(TryAcquireError::Closed) => Err(AdmissionError::Closed),
        }
    }

    /// Sessions currently admitted.
    pub fn active(&self) -> usize {
        self.limit - self.slots.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Refuses all further admissions.
    pub fn close(&self) {
        self.slots.close();
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(protocol::MAX_SESSIONS)
    }
}
