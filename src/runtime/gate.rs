// src/runtime/gate.rs
//! Global admission control shared by the sync and async paths

use crate::utils::errors::{EngineError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Bounded number of in-flight executions
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    max: usize,
    wait: Duration,
}

/// Held for the whole execution; releases its slot on drop
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConcurrencyGate {
    pub fn new(max: usize, wait: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max,
            wait,
        }
    }

    /// Wait up to the configured time for a slot
    pub async fn acquire(&self) -> Result<GatePermit> {
        let started = Instant::now();
        let permit = match tokio::time::timeout(self.wait, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(EngineError::Internal("concurrency gate closed".into())),
            Err(_) => {
                debug!(max = self.max, "concurrency gate wait timed out");
                return Err(EngineError::ConcurrencyLimit {
                    max: self.max,
                    waited: started.elapsed(),
                });
            }
        };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(GatePermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Stop admitting work; waiters fail immediately
    pub fn close(&self) {
        self.semaphore.close();
    }
}
