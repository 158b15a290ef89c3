use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::proxy::{LogShipper, TracingLogShipper};
use crate::routing::HostSwitch;
use crate::server::state::FrontendRuntime;
use crate::server::GatewayState;
use crate::upstream::{Backend, Upstream};
use std::collections::HashMap;
use std::sync::Arc;

/// Build the process-wide `GatewayState` from a loaded configuration:
/// one `Backend` per configured `http_backend` entry, one `FrontendRuntime`
/// (with its compiled host-switch) per `http_frontend` entry. Mirrors the
/// source's `Backplane.Configure()`: backends are built first so frontends
/// can resolve their route's backend name against the completed map.
pub fn configure(cfg: &GatewayConfig, metrics: Metrics) -> anyhow::Result<GatewayState> {
    cfg.validate()?;

    let mut backends = HashMap::new();
    for backend_cfg in &cfg.http_backend {
        let upstreams = backend_cfg
            .server
            .iter()
            .map(|s| Arc::new(Upstream::new(s.address.clone(), s.weight, s.maxconn, default_target_qps())))
            .collect();
        backends.insert(
            backend_cfg.name.clone(),
            Arc::new(Backend::new(backend_cfg.name.clone(), upstreams)),
        );
    }

    for backend in backends.values() {
        for upstream in backend.balancer.upstreams() {
            let backend = backend.clone();
            let upstream_addr = upstream.address.clone();
            upstream.spawn_health_checker(move |_healthy| {
                tracing::debug!(backend = %backend.name, upstream = %upstream_addr, "health transition, rebuilding active set");
                backend.balancer.rebuild_active();
            });
        }
        backend.balancer.rebuild_active();
    }

    let frontends = cfg
        .http_frontend
        .iter()
        .map(|f| {
            Ok::<_, anyhow::Error>(FrontendRuntime {
                name: f.name.clone(),
                bind_http: f.bind_http.clone(),
                bind_https: f.bind_https.clone(),
                server_string: f.server_string.clone(),
                host_switch: Arc::new(HostSwitch::from_config(f)),
                counters: crate::counters::Counters::new(),
                max_conn_rate: f.max_conn_rate,
                max_conns: f.max_conns,
                ssl_max_conn_rate: f.ssl_max_conn_rate,
                ssl_max_conns: f.ssl_max_conns,
                tls_config: tls_config_for(f)?,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    metrics::gauge!("gateway_config_backends_total").set(backends.len() as f64);
    metrics::gauge!("gateway_config_frontends_total").set(frontends.len() as f64);

    let shipper: Arc<dyn LogShipper> = Arc::new(TracingLogShipper);
    Ok(GatewayState::new(backends, frontends, shipper, metrics))
}

fn default_target_qps() -> f64 {
    999_999.0
}

/// Build the TLS server config for a frontend that configures `bind_https`.
/// Certificates come either from explicit `ssl_cert` file paths or from a
/// glob `ssl_cert_mask`; the first loaded cert/key pair is used as the
/// single identity served to every SNI name on this frontend (per-SNI
/// certificate selection is out of scope).
fn tls_config_for(
    f: &crate::config::FrontendConfig,
) -> anyhow::Result<Option<Arc<rustls::ServerConfig>>> {
    if f.bind_https.is_none() {
        return Ok(None);
    }

    let mut pairs: Vec<crate::net::CertPair> = f
        .ssl_cert
        .iter()
        .map(|path| crate::net::key_pair_from_file(std::path::Path::new(path)))
        .collect::<Result<_, _>>()?;
    if let Some(mask) = &f.ssl_cert_mask {
        pairs.extend(crate::net::load_certs_by_mask(mask));
    }

    let pair = pairs
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("frontend {} configures bind_https but no certificate could be loaded", f.name))?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(pair.cert_chain, pair.key)?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Some(Arc::new(server_config)))
}
