//! Process-wide admission control for fetch/upload work.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

struct GateInner {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Counting semaphore bounding how many feeds may fetch and upload at once.
/// Waiters are admitted in FIFO order.
#[derive(Clone)]
pub struct ConcurrencyGate {
    inner: Arc<GateInner>,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        ConcurrencyGate {
            inner: Arc::new(GateInner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Waits for a slot. The slot is released when the returned permit is
    /// dropped, on every exit path including unwinding.
    pub async fn acquire(&self) -> Result<GatePermit, AcquireError> {
        let permit = self.inner.semaphore.clone().acquire_owned().await?;
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);

        Ok(GatePermit {
            _permit: permit,
            inner: self.inner.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of permits held at the same time since creation.
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    /// Wakes all waiters with an error. Held permits stay valid.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }
}

pub struct GatePermit {
    // Dropped after the counter update in `Drop::drop`
    _permit: OwnedSemaphorePermit,
    inner: Arc<GateInner>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
