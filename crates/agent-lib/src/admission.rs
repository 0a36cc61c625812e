//! Admission control for concurrent sampling sessions
//!
//! Every sampling session holds one ticket from acquisition until its raw
//! trace has been symbolized. Callers beyond the capacity wait; a caller that
//! gives up while waiting never holds capacity.

use crate::error::{ProfilerError, Result};
use crate::observability::AgentMetrics;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default number of concurrent sampling sessions per node
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;

#[derive(Clone)]
pub struct Admission {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    metrics: Option<AgentMetrics>,
}

impl Admission {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            metrics: None,
        }
    }

    /// Report tickets in use on the in-flight gauge
    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tickets currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a ticket, or give up when `cancel` fires
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<AdmissionTicket> {
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                // The semaphore is never closed
                permit.map_err(|e| ProfilerError::Worker(e.to_string()))?
            }
            _ = cancel.cancelled() => {
                debug!("Cancelled while waiting for admission");
                return Err(ProfilerError::Cancelled);
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.sampling_started();
        }
        Ok(AdmissionTicket {
            _permit: permit,
            metrics: self.metrics.clone(),
        })
    }
}

/// Proof of admission; capacity is returned when dropped
pub struct AdmissionTicket {
    _permit: OwnedSemaphorePermit,
    metrics: Option<AgentMetrics>,
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.sampling_finished();
        }
    }
}
