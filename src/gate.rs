//! Concurrency gate bounding in-flight requests.
//!
//! Backed by a tokio semaphore so that async tasks and plain OS threads draw
//! from the same pool of permits. Permits are RAII values; dropping one on any
//! path, including `?` and panics, returns it to the gate.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::{Result, ThrottlerError};

#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
}

/// A held slot in a [`ConcurrencyGate`].
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    /// Waits for a free slot without blocking the worker thread.
    pub async fn enter(&self) -> Result<GatePermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ThrottlerError::GateClosed)?;
        Ok(GatePermit { _permit: permit })
    }

    /// Blocks the calling thread until a slot is free.
    ///
    /// Must not be called from inside an async task.
    pub fn enter_blocking(&self) -> Result<GatePermit> {
        futures::executor::block_on(self.enter())
    }

    /// Takes a slot only if one is free right now.
    pub fn try_enter(&self) -> Result<Option<GatePermit>> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(Some(GatePermit { _permit: permit })),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(ThrottlerError::GateClosed),
        }
    }

    /// Returns a slot. Equivalent to dropping the permit.
    pub fn exit(&self, permit: GatePermit) {
        drop(permit);
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrency - self.available()
    }
}
