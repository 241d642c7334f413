// Connection gate - bounded concurrency toward upstream hosts with FIFO admission

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{GatewayError, Result};

pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Admission control for upstream calls.
///
/// Backed by a tokio `Semaphore`, whose waiters are served strictly in
/// arrival order. Completion order is whatever upstream latency makes it.
pub struct ConnectionGate {
    semaphore: Arc<Semaphore>,
    max_connections: usize,
    in_flight: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

/// Holds one gate slot; the slot is handed to the next waiter on drop.
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct QueuedCall {
    queued: Arc<AtomicUsize>,
}

impl Drop for QueuedCall {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConnectionGate {
    pub fn new(max_connections: usize) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            in_flight: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<GatePermit> {
        if self.semaphore.available_permits() == 0 {
            tracing::debug!(
                "[Gate] {} upstream calls in flight, queueing (queued: {})",
                self.max_connections,
                self.queued()
            );
        }

        self.queued.fetch_add(1, Ordering::SeqCst);
        let waiting = QueuedCall {
            queued: self.queued.clone(),
        };
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("connection gate closed: {}", e)))?;
        drop(waiting);

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(GatePermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    /// Run `invoke` once a slot is free, releasing the slot when it settles.
    pub async fn execute<F, Fut, T>(&self, invoke: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self.acquire().await?;
        invoke().await
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl Default for ConnectionGate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS)
    }
}
