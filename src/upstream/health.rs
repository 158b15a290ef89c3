use crate::counters::Counters;
use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

const PROBE_INTERVAL: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health state for one upstream, written only by its own probe task.
pub struct HealthState {
    healthy: AtomicBool,
    status: Mutex<String>,
    last_change_ns: AtomicI64,
    probed_at_least_once: AtomicBool,
    started: Instant,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            // Never-probed upstreams start unhealthy and stay excluded from
            // the active set until their first probe completes.
            healthy: AtomicBool::new(false),
            status: Mutex::new("unprobed".to_string()),
            last_change_ns: AtomicI64::new(0),
            probed_at_least_once: AtomicBool::new(false),
            started: Instant::now(),
        }
    }
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> String {
        self.status.lock().expect("health status lock poisoned").clone()
    }

    /// Force the health flag without running a probe, for tests of
    /// components (the balancer) that only care about the flag's value.
    #[cfg(test)]
    pub fn force_healthy(&self, value: bool) {
        self.healthy.store(value, Ordering::SeqCst);
    }
}

/// Periodic HEAD prober for one upstream. Runs on its own task; on any
/// observed transition (or on the very first completed probe) invokes
/// `on_change` with the internal state already released, per the
/// deadlock-avoidance rule: never call external callbacks under a lock.
pub struct HealthChecker {
    address: String,
    client: Client<HttpConnector, Empty<Bytes>>,
    state: Arc<HealthState>,
}

impl HealthChecker {
    pub fn new(address: String) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(PROBE_TIMEOUT));
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);
        Self {
            address,
            client,
            state: Arc::new(HealthState::default()),
        }
    }

    pub fn state(&self) -> Arc<HealthState> {
        self.state.clone()
    }

    /// Run probes forever: immediately, then every `PROBE_INTERVAL`.
    pub async fn run<F>(&self, on_change: F)
    where
        F: Fn(bool) + Send + Sync,
    {
        loop {
            self.probe_once(&on_change).await;
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    async fn probe_once<F>(&self, on_change: &F)
    where
        F: Fn(bool) + Send + Sync,
    {
        let url: hyper::Uri = format!("http://{}/", self.address).parse().unwrap();
        let start = Instant::now();

        let req = hyper::Request::builder()
            .method(hyper::Method::HEAD)
            .uri(url)
            .body(Empty::<Bytes>::new())
            .expect("well-formed probe request");

        let outcome = tokio::time::timeout(PROBE_TIMEOUT, self.client.request(req)).await;
        let elapsed = start.elapsed();

        let (new_healthy, status) = match outcome {
            Err(_timeout) => (false, format!("error: timeout in {elapsed:?}")),
            Ok(Err(e)) => (false, format!("error: {e} in {elapsed:?}")),
            Ok(Ok(resp)) if resp.status() == hyper::StatusCode::OK => {
                (true, format!("status {} in {elapsed:?}", resp.status()))
            }
            Ok(Ok(resp)) => (
                false,
                format!("error: status {} in {elapsed:?}", resp.status()),
            ),
        };

        let previously_healthy = self.state.healthy.load(Ordering::SeqCst);
        let first_probe = !self.state.probed_at_least_once.swap(true, Ordering::SeqCst);
        let changed = new_healthy != previously_healthy || first_probe;

        self.state.healthy.store(new_healthy, Ordering::SeqCst);
        *self.state.status.lock().expect("health status lock poisoned") = status.clone();

        if changed {
            let now_ns = self.state.started.elapsed().as_nanos() as i64;
            self.state.last_change_ns.store(now_ns, Ordering::SeqCst);
            debug!(address = %self.address, healthy = new_healthy, %status, "upstream health transition");
            on_change(new_healthy);
        }
    }
}

/// Per-upstream aggregate used by the balancer and stats snapshot.
pub struct Upstream {
    pub address: String,
    pub weight: u32,
    pub max_conn: usize,
    pub counters: Counters,
    pub rate_limiter: crate::limiter::EmaRateLimiter,
    pub transport: crate::upstream::transport::UpstreamClient,
    health_state: Arc<HealthState>,
}

impl Upstream {
    pub fn new(address: String, weight: u32, max_conn: usize, target_qps: f64) -> Self {
        Self {
            transport: crate::upstream::transport::build_upstream_client(address.clone()),
            address,
            weight,
            max_conn,
            counters: Counters::new(),
            rate_limiter: crate::limiter::EmaRateLimiter::new(target_qps),
            health_state: Arc::new(HealthState::default()),
        }
    }

    pub fn health_state(&self) -> Arc<HealthState> {
        self.health_state.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.health_state.is_healthy()
    }

    /// Spawn the background health-check task for this upstream, wired to
    /// invoke `on_change` whenever its health flag transitions (or on the
    /// first completed probe).
    pub fn spawn_health_checker<F>(&self, on_change: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let checker = HealthChecker::new(self.address.clone());
        tokio::spawn(async move {
            checker.run(on_change).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn never_probed_upstream_starts_unhealthy() {
        let state = HealthState::default();
        assert!(!state.is_healthy());
    }

    #[tokio::test]
    async fn first_probe_always_triggers_on_change_even_without_transition() {
        // A closed port keeps the probe failing, same as the default, yet
        // the callback must still fire because it is the first probe.
        let checker = HealthChecker::new("127.0.0.1:1".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        checker
            .probe_once(&move |_healthy| {
                calls2.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_probe_against_a_responsive_server_marks_healthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                });
            }
        });

        let checker = HealthChecker::new(addr.to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        checker
            .probe_once(&move |healthy| {
                assert!(healthy);
                calls2.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(checker.state().is_healthy());
    }
}
