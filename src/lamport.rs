use std::sync::atomic::{AtomicI64, Ordering};

/// Monotonic logical timestamp with receive-side merge, per Lamport's
/// original clock rule: on receiving a remote timestamp, adopt
/// `max(local, remote) + 1` when the remote is not already behind.
#[derive(Debug, Default)]
pub struct LamportClock {
    epoch: AtomicI64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self {
            epoch: AtomicI64::new(0),
        }
    }

    pub fn get_epoch(&self) -> i64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn increment_epoch(&self) -> i64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merge a timestamp observed on an incoming message. Returns the
    /// resulting local value.
    pub fn on_received_epoch(&self, other: i64) -> i64 {
        loop {
            let cur = self.epoch.load(Ordering::SeqCst);
            if other < cur {
                return cur;
            }
            let new_val = other + 1;
            match self.epoch.compare_exchange_weak(
                cur,
                new_val,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return new_val,
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_are_strictly_monotonic() {
        let c = LamportClock::new();
        assert_eq!(c.increment_epoch(), 1);
        assert_eq!(c.increment_epoch(), 2);
        assert_eq!(c.get_epoch(), 2);
    }

    #[test]
    fn receiving_behind_value_does_not_move_clock() {
        let c = LamportClock::new();
        c.increment_epoch();
        c.increment_epoch();
        c.increment_epoch(); // epoch = 3
        assert_eq!(c.on_received_epoch(1), 3);
        assert_eq!(c.get_epoch(), 3);
    }

    #[test]
    fn receiving_ahead_value_advances_clock_past_it() {
        let c = LamportClock::new();
        c.increment_epoch(); // epoch = 1
        assert_eq!(c.on_received_epoch(5), 6);
        assert_eq!(c.get_epoch(), 6);
    }

    #[test]
    fn receiving_equal_value_advances_by_one() {
        let c = LamportClock::new();
        c.increment_epoch(); // epoch = 1
        assert_eq!(c.on_received_epoch(1), 2);
    }

    #[test]
    fn result_is_always_at_least_the_max_of_everything_observed() {
        let c = LamportClock::new();
        let mut observed_max = 0i64;
        for v in [10, 3, 20, 1, 7] {
            observed_max = observed_max.max(v);
            let result = c.on_received_epoch(v);
            assert!(result >= observed_max);
        }
    }
}
