//! Bounded in-flight admission.

use crate::errors::{IntegrationError, IntegrationResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Semaphore, SemaphorePermit};

/// Counters describing gate occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Configured cap; `None` is unbounded.
    pub limit: Option<usize>,
    /// Requests currently admitted.
    pub active: usize,
    /// Highest simultaneous admission count.
    pub peak: usize,
    /// Requests waiting for a slot.
    pub queued: usize,
}

/// FIFO admission queue bounding in-flight requests.
///
/// Waiters are served in arrival order by the underlying tokio semaphore.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Option<Semaphore>,
    limit: Option<usize>,
    active: AtomicUsize,
    peak: AtomicUsize,
    queued: AtomicUsize,
}

impl ConcurrencyGate {
    /// Creates a gate; `None` admits everything immediately.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            semaphore: limit.map(|n| Semaphore::new(n.min(Semaphore::MAX_PERMITS))),
            limit,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    /// Waits for a slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> IntegrationResult<GatePermit<'_>> {
        let permit = match &self.semaphore {
            Some(semaphore) => {
                let _waiting = Counted::enter(&self.queued);
                let permit = semaphore.acquire().await.map_err(|_| {
                    IntegrationError::validation("Concurrency gate is closed")
                })?;
                Some(permit)
            }
            None => None,
        };

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        Ok(GatePermit {
            _permit: permit,
            active: &self.active,
        })
    }

    /// Current occupancy.
    pub fn stats(&self) -> GateStats {
        GateStats {
            limit: self.limit,
            active: self.active.load(Ordering::SeqCst),
            peak: self.peak.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }
}

/// An admitted slot.
#[derive(Debug)]
pub struct GatePermit<'a> {
    _permit: Option<SemaphorePermit<'a>>,
    active: &'a AtomicUsize,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Increments a counter for as long as it lives.
struct Counted<'a>(&'a AtomicUsize);

impl<'a> Counted<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Counted<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unbounded_gate_never_waits() {
        let gate = ConcurrencyGate::new(None);
        let a = gate.acquire().await.unwrap();
        let b = gate.acquire().await.unwrap();

        assert_eq!(gate.stats().active, 2);
        drop(a);
        drop(b);
        assert_eq!(gate.stats().active, 0);
        assert_eq!(gate.stats().peak, 2);
    }

    #[tokio::test]
    async fn test_limit_above_permit_ceiling_is_clamped() {
        let gate = ConcurrencyGate::new(Some(usize::MAX));

        let permit = gate.acquire().await.unwrap();

        assert_eq!(gate.stats().active, 1);
        drop(permit);
        assert_eq!(gate.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_gate_caps_active() {
        let gate = Arc::new(ConcurrencyGate::new(Some(2)));
        let mut handles = Vec::new();

        for _ in 0..5 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let stats = gate.stats();
        assert_eq!(stats.peak, 2);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_released_in_arrival_order() {
        let gate = Arc::new(ConcurrencyGate::new(Some(1)));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let first = gate.acquire().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let gate = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                order.lock().push(i);
            }));
            // Let each waiter enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(gate.stats().queued, 3);
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
