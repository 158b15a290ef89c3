use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded-capacity concurrency limiter. Capacity 0 yields an unlimited
/// variant whose acquire/release are no-ops and whose `limit()` reports 0.
///
/// Cheaply cloneable; the returned guard is owned (no borrow of the
/// limiter), so it can be carried across an await point or stashed inside
/// an accepted-connection wrapper and released on drop.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    sem: Option<Arc<Semaphore>>,
    limit: usize,
    in_use: Arc<AtomicUsize>,
}

pub enum LimiterGuard {
    Bounded {
        _permit: OwnedSemaphorePermit,
        in_use: Arc<AtomicUsize>,
    },
    Unlimited,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            sem: if capacity == 0 {
                None
            } else {
                Some(Arc::new(Semaphore::new(capacity)))
            },
            limit: capacity,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Blocks until a slot is available.
    pub async fn acquire(&self) -> LimiterGuard {
        match &self.sem {
            None => LimiterGuard::Unlimited,
            Some(sem) => {
                let permit = sem
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("limiter semaphore is never closed");
                self.in_use.fetch_add(1, Ordering::SeqCst);
                LimiterGuard::Bounded {
                    _permit: permit,
                    in_use: self.in_use.clone(),
                }
            }
        }
    }

    pub fn size(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Drop for LimiterGuard {
    fn drop(&mut self) {
        if let LimiterGuard::Bounded { in_use, .. } = self {
            in_use.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn zero_capacity_is_unlimited_and_never_blocks() {
        let lim = ConcurrencyLimiter::new(0);
        let mut guards = Vec::new();
        for _ in 0..1000 {
            guards.push(lim.acquire().await);
        }
        assert_eq!(lim.limit(), 0);
        assert_eq!(lim.size(), 0);
    }

    #[tokio::test]
    async fn bounded_capacity_blocks_beyond_limit() {
        let lim = ConcurrencyLimiter::new(1);
        let g1 = lim.acquire().await;
        assert_eq!(lim.size(), 1);

        let lim2 = lim.clone();
        let handle = tokio::spawn(async move {
            let _g2 = lim2.acquire().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        drop(g1);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn size_never_exceeds_limit_under_concurrent_acquire() {
        let lim = ConcurrencyLimiter::new(4);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let lim = lim.clone();
            handles.push(tokio::spawn(async move {
                let _g = lim.acquire().await;
                assert!(lim.size() <= 4);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(lim.size(), 0);
    }

    #[tokio::test]
    async fn release_decrements_count_exactly_once() {
        let lim = ConcurrencyLimiter::new(2);
        let g = lim.acquire().await;
        assert_eq!(lim.size(), 1);
        drop(g);
        assert_eq!(lim.size(), 0);
    }
}
