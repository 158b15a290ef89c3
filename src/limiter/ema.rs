use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Smoothing weight for the exponentially weighted moving average.
const WQ: f64 = 0.05;
/// Initial EMA of inter-arrival time: effectively idle.
const INITIAL_WAITING_NS: f64 = 1e12;
/// Below this target QPS the limiter is treated as unlimited.
const MIN_MEANINGFUL_QPS: f64 = 0.1;
const UNLIMITED_QPS: f64 = 1_000_000.0;

/// Admission controller keeping the EMA of inter-arrival time at or above
/// a target, which is equivalent to bounding the EMA of QPS at or below
/// `target_qps`. All bookkeeping is lock-free: a single CAS loop drives
/// the accept decision, and the "time of last accepted" timestamp is
/// recorded even when a subsequent CAS attempt has to retry.
pub struct EmaRateLimiter {
    target_qps: f64,
    target_interval_ns: f64,
    start: Instant,
    last_accepted_ns: AtomicI64,
    avg_waiting_ns: AtomicU64,
    min_waiting_ns: AtomicU64,
    accepted: AtomicI64,
    rejected: AtomicI64,
}

impl EmaRateLimiter {
    pub fn new(target_qps: f64) -> Self {
        let target_qps = if target_qps <= MIN_MEANINGFUL_QPS {
            UNLIMITED_QPS
        } else {
            target_qps
        };
        let target_interval_ns = 1e9 / target_qps;
        Self {
            target_qps,
            target_interval_ns,
            start: Instant::now(),
            last_accepted_ns: AtomicI64::new(0),
            avg_waiting_ns: AtomicU64::new(INITIAL_WAITING_NS.to_bits()),
            min_waiting_ns: AtomicU64::new(INITIAL_WAITING_NS.to_bits()),
            accepted: AtomicI64::new(0),
            rejected: AtomicI64::new(0),
        }
    }

    fn now_ns(&self) -> i64 {
        self.start.elapsed().as_nanos() as i64
    }

    /// Admit or reject the current request.
    pub fn accept(&self) -> bool {
        loop {
            let now = self.now_ns();
            let last = self.last_accepted_ns.load(Ordering::SeqCst);
            let inst = (now - last) as f64;

            let observed_ema_bits = self.avg_waiting_ns.load(Ordering::SeqCst);
            let observed_ema = f64::from_bits(observed_ema_bits);
            let new_ema = (1.0 - WQ) * observed_ema + WQ * inst;

            if new_ema < self.target_interval_ns {
                self.rejected.fetch_add(1, Ordering::SeqCst);
                return false;
            }

            // Record "now" even if the CAS below loses the race, matching
            // the reference semantics: acceptance timing must reflect
            // attempts, not just winners.
            self.last_accepted_ns.store(now, Ordering::SeqCst);

            if self
                .avg_waiting_ns
                .compare_exchange(
                    observed_ema_bits,
                    new_ema.to_bits(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                continue;
            }

            self.min_waiting_ns
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                    let cur_min = f64::from_bits(bits);
                    if new_ema < cur_min {
                        Some(new_ema.to_bits())
                    } else {
                        None
                    }
                })
                .ok();

            self.accepted.fetch_add(1, Ordering::SeqCst);
            return true;
        }
    }

    pub fn target_qps(&self) -> f64 {
        self.target_qps
    }

    pub fn max_qps(&self) -> f64 {
        1e9 / f64::from_bits(self.min_waiting_ns.load(Ordering::SeqCst))
    }

    pub fn current_qps(&self) -> f64 {
        1e9 / f64::from_bits(self.avg_waiting_ns.load(Ordering::SeqCst))
    }

    pub fn accepted_count(&self) -> i64 {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn rejected_count(&self) -> i64 {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn last_accepted(&self) -> Duration {
        Duration::from_nanos(self.last_accepted_ns.load(Ordering::SeqCst).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn unlimited_below_threshold_accepts_everything() {
        let lim = EmaRateLimiter::new(0.05);
        for _ in 0..50 {
            assert!(lim.accept());
        }
    }

    #[test]
    fn accepted_plus_rejected_equals_call_count() {
        let lim = EmaRateLimiter::new(10.0);
        let calls = 200;
        for _ in 0..calls {
            lim.accept();
            thread::sleep(Duration::from_micros(200));
        }
        assert_eq!(lim.accepted_count() + lim.rejected_count(), calls);
    }

    #[test]
    fn long_run_acceptance_rate_tracks_target_qps() {
        let target = 100.0;
        let lim = EmaRateLimiter::new(target);
        let period = Duration::from_secs_f64(1.0 / target);
        let total = Duration::from_secs(1);
        let start = Instant::now();
        let mut ticks = 0;
        while start.elapsed() < total {
            lim.accept();
            thread::sleep(period);
            ticks += 1;
        }
        let accepted = lim.accepted_count();
        // With arrivals paced exactly at target rate, acceptance should be
        // close to full; generous bound given sleep jitter.
        assert!(
            accepted as f64 >= ticks as f64 * 0.5,
            "accepted={} ticks={}",
            accepted,
            ticks
        );
    }

    #[test]
    fn concurrent_accepts_keep_an_exact_total_count() {
        let lim = Arc::new(EmaRateLimiter::new(1000.0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lim = lim.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    lim.accept();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lim.accepted_count() + lim.rejected_count(), 800);
    }
}
