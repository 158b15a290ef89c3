use crate::metrics::Metrics;
use crate::proxy::context::LogShipper;
use crate::routing::HostSwitch;
use crate::upstream::Backend;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// One configured frontend: its name, bind addresses, and compiled
/// host-switch, shared between its HTTP and HTTPS listeners (if both
/// are configured) and exposed to the stats snapshot.
pub struct FrontendRuntime {
    pub name: String,
    pub bind_http: Option<String>,
    pub bind_https: Option<String>,
    pub server_string: String,
    pub host_switch: Arc<HostSwitch>,
    pub counters: crate::counters::Counters,
    pub max_conn_rate: f64,
    pub max_conns: usize,
    pub ssl_max_conn_rate: f64,
    pub ssl_max_conns: usize,
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
}

/// Process-wide shared state: every backend (keyed by name), every
/// configured frontend, and the access-log shipper. Built once at
/// startup from the loaded configuration and never mutated afterward
/// (dynamic reload is out of scope).
#[derive(Clone)]
pub struct GatewayState {
    pub backends: Arc<HashMap<String, Arc<Backend>>>,
    pub frontends: Arc<Vec<Arc<FrontendRuntime>>>,
    pub log_shipper: Arc<dyn LogShipper>,
    pub metrics: Metrics,
    pub started: Instant,
}

impl GatewayState {
    pub fn new(
        backends: HashMap<String, Arc<Backend>>,
        frontends: Vec<FrontendRuntime>,
        log_shipper: Arc<dyn LogShipper>,
        metrics: Metrics,
    ) -> Self {
        Self {
            backends: Arc::new(backends),
            frontends: Arc::new(frontends.into_iter().map(Arc::new).collect()),
            log_shipper,
            metrics,
            started: Instant::now(),
        }
    }
}
