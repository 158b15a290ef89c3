use crate::error::BackplaneError;
use crate::upstream::health::Upstream;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unweighted round-robin balancer over the healthy subset of a fixed,
/// configuration-ordered list of upstreams. Configured weights are
/// retained on `Upstream` for introspection only; selection never reads
/// them (weighted balancing is out of scope).
///
/// The active subset is a copy-on-write snapshot: health-check callbacks
/// swap in a new `Arc<Vec<_>>`, and round trips load a cheap reference
/// without ever blocking a writer. The round-robin index is a free-running
/// atomic counter independent of the active subset's length, so a resize
/// mid-flight never corrupts the cursor.
pub struct Balancer {
    upstreams: Vec<Arc<Upstream>>,
    active: ArcSwap<Vec<Arc<Upstream>>>,
    cursor: AtomicU64,
}

impl Balancer {
    pub fn new(upstreams: Vec<Arc<Upstream>>) -> Self {
        Self {
            upstreams,
            active: ArcSwap::from_pointee(Vec::new()),
            cursor: AtomicU64::new(0),
        }
    }

    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    /// Recompute the active subset as the subsequence of `upstreams` that
    /// are currently healthy, preserving configuration order, and publish
    /// it atomically. Called from health-checker on-change callbacks.
    pub fn rebuild_active(&self) {
        let next: Vec<Arc<Upstream>> = self
            .upstreams
            .iter()
            .filter(|u| u.is_healthy())
            .cloned()
            .collect();
        self.active.store(Arc::new(next));
    }

    /// Select the next upstream in round-robin order over the active
    /// subset snapshot at the time of the call.
    pub fn select(&self) -> Result<Arc<Upstream>, BackplaneError> {
        let snapshot = self.active.load();
        if snapshot.is_empty() {
            return Err(BackplaneError::NoHealthyBackendAvailable);
        }
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst) as usize;
        Ok(snapshot[idx % snapshot.len()].clone())
    }

    pub fn active_count(&self) -> usize {
        self.active.load().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_upstream(addr: &str) -> Arc<Upstream> {
        let u = Upstream::new(addr.to_string(), 100, 0, 1_000_000.0);
        u.health_state().force_healthy(true);
        Arc::new(u)
    }

    #[test]
    fn empty_active_set_fails_with_no_healthy_backend() {
        let b = Balancer::new(vec![Arc::new(Upstream::new(
            "127.0.0.1:9".to_string(),
            100,
            0,
            1_000_000.0,
        ))]);
        // rebuild_active() never ran, so active set is empty by construction.
        assert!(matches!(
            b.select(),
            Err(BackplaneError::NoHealthyBackendAvailable)
        ));
    }

    #[test]
    fn distributes_n_round_trips_evenly_across_k_healthy_upstreams() {
        let upstreams: Vec<Arc<Upstream>> = (0..3)
            .map(|i| healthy_upstream(&format!("127.0.0.1:{}", 9000 + i)))
            .collect();
        let b = Balancer::new(upstreams.clone());
        b.rebuild_active();

        let mut counts = std::collections::HashMap::new();
        let n = 100;
        for _ in 0..n {
            let picked = b.select().unwrap();
            *counts.entry(picked.address.clone()).or_insert(0) += 1;
        }
        for u in &upstreams {
            let c = counts.get(&u.address).copied().unwrap_or(0);
            assert!(c == n / 3 || c == n / 3 + 1, "count={c} for {}", u.address);
        }
    }
}
