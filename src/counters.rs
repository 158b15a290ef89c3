use std::sync::atomic::{AtomicI64, Ordering};

/// Atomic triple tracked by every handler stage (frontend, vhost, route,
/// backend, upstream): current active sessions, historic max active
/// sessions, total sessions. `current` is incremented/decremented across
/// the lifetime of one in-flight request; `max` only ever grows.
#[derive(Default)]
pub struct Counters {
    current_active: AtomicI64,
    max_active: AtomicI64,
    total: AtomicI64,
}

/// RAII guard: `in()` on acquire, `out()` on drop.
pub struct CountersGuard<'a> {
    counters: &'a Counters,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> CountersGuard<'_> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let active = self.current_active.fetch_add(1, Ordering::SeqCst) + 1;
        loop {
            let max = self.max_active.load(Ordering::SeqCst);
            if active <= max {
                break;
            }
            if self
                .max_active
                .compare_exchange(max, active, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        CountersGuard { counters: self }
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            current_active: self.current_active.load(Ordering::SeqCst),
            max_active: self.max_active.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
        }
    }
}

impl Drop for CountersGuard<'_> {
    fn drop(&mut self) {
        self.counters.current_active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CountersSnapshot {
    pub current_active: i64,
    pub max_active: i64,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_tracks_the_highest_concurrent_value_seen() {
        let c = Counters::new();
        let g1 = c.enter();
        let g2 = c.enter();
        assert_eq!(c.snapshot().current_active, 2);
        assert_eq!(c.snapshot().max_active, 2);
        drop(g1);
        assert_eq!(c.snapshot().current_active, 1);
        assert_eq!(c.snapshot().max_active, 2);
        drop(g2);
        assert_eq!(c.snapshot().current_active, 0);
        assert_eq!(c.snapshot().max_active, 2);
    }

    #[test]
    fn total_is_monotonically_non_decreasing() {
        let c = Counters::new();
        for _ in 0..5 {
            let _g = c.enter();
        }
        assert_eq!(c.snapshot().total, 5);
    }

    #[test]
    fn concurrent_enters_never_leave_max_below_an_observed_peak() {
        use std::sync::Arc;
        use std::thread;

        let c = Arc::new(Counters::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = c.clone();
            handles.push(thread::spawn(move || {
                let _g = c.enter();
                thread::sleep(std::time::Duration::from_millis(5));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let snap = c.snapshot();
        assert_eq!(snap.current_active, 0);
        assert_eq!(snap.total, 8);
        assert!(snap.max_active >= 1 && snap.max_active <= 8);
    }
}
