//! Admission gate
//!
//! A counting semaphore bounding the number of concurrently running visit
//! tasks across the whole pool. Permits are owned values released exactly
//! once on drop, which covers every task exit path: success, skip, fault,
//! and cancellation.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::DispatchError;

/// Bounds total in-flight visit work.
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl AdmissionGate {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Acquire one permit, waiting if the gate is full.
    ///
    /// Fails only once the gate has been closed for shutdown.
    pub async fn admit(&self) -> Result<AdmissionPermit, DispatchError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::GateClosed)?;
        Ok(AdmissionPermit { _permit: permit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits currently held by running tasks.
    pub fn in_flight(&self) -> usize {
        self.limit.saturating_sub(self.semaphore.available_permits())
    }

    /// Refuse all further admissions. Held permits still release normally.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// One unit of admitted work; dropping it releases the slot.
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}
