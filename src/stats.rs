use crate::counters::CountersSnapshot;
use crate::server::GatewayState;
use serde::Serialize;

#[derive(Serialize)]
pub struct UpstreamSnapshot {
    pub address: String,
    pub weight: u32,
    pub healthy: bool,
    pub status: String,
    pub counters: CountersSnapshot,
}

#[derive(Serialize)]
pub struct BackendSnapshot {
    pub name: String,
    pub counters: CountersSnapshot,
    pub upstreams: Vec<UpstreamSnapshot>,
}

#[derive(Serialize)]
pub struct FrontendSnapshot {
    pub name: String,
    pub bind_http: Option<String>,
    pub bind_https: Option<String>,
    pub counters: CountersSnapshot,
}

#[derive(Serialize)]
pub struct ResourceLimits {
    pub open_files_soft: Option<u64>,
    pub open_files_hard: Option<u64>,
}

#[derive(Serialize)]
pub struct StatsSnapshot {
    pub pid: u32,
    pub hostname: String,
    pub uptime_secs: u64,
    pub limits: ResourceLimits,
    pub frontends: Vec<FrontendSnapshot>,
    pub backends: Vec<BackendSnapshot>,
}

/// Assemble the in-process stats snapshot from the live frontend/backend
/// tree. Never dials an upstream; this is the handler for the reserved
/// `internalstats` backend name.
pub fn build_snapshot(state: &GatewayState) -> StatsSnapshot {
    let frontends = state
        .frontends
        .iter()
        .map(|f| FrontendSnapshot {
            name: f.name.clone(),
            bind_http: f.bind_http.clone(),
            bind_https: f.bind_https.clone(),
            counters: f.counters.snapshot(),
        })
        .collect();

    let backends = state
        .backends
        .values()
        .map(|b| BackendSnapshot {
            name: b.name.clone(),
            counters: b.counters.snapshot(),
            upstreams: b
                .balancer
                .upstreams()
                .iter()
                .map(|u| UpstreamSnapshot {
                    address: u.address.clone(),
                    weight: u.weight,
                    healthy: u.is_healthy(),
                    status: u.health_state().status(),
                    counters: u.counters.snapshot(),
                })
                .collect(),
        })
        .collect();

    StatsSnapshot {
        pid: std::process::id(),
        hostname: hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string()),
        uptime_secs: state.started.elapsed().as_secs(),
        limits: resource_limits(),
        frontends,
        backends,
    }
}

#[cfg(unix)]
fn resource_limits() -> ResourceLimits {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // Best-effort: getrlimit failure leaves both fields at None.
    let ok = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) == 0 };
    if ok {
        ResourceLimits {
            open_files_soft: Some(rl.rlim_cur as u64),
            open_files_hard: Some(rl.rlim_max as u64),
        }
    } else {
        ResourceLimits {
            open_files_soft: None,
            open_files_hard: None,
        }
    }
}

#[cfg(not(unix))]
fn resource_limits() -> ResourceLimits {
    ResourceLimits {
        open_files_soft: None,
        open_files_hard: None,
    }
}
