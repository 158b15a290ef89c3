mod path_mux;

pub use path_mux::{PathMatch, PathMux};

use crate::config::FrontendConfig;
use std::collections::HashMap;
use std::sync::Arc;

/// One named route: path binding to a backend, optionally gated by auth
/// and throttled. Owned by a `Vhost`.
pub struct Route {
    pub path: String,
    pub backend_name: String,
    pub auth: Option<crate::auth::BasicAuthConfig>,
    pub max_rate: Option<f64>,
    pub max_conn: usize,
}

/// Virtual host: a set of domain names (or default) bound to a set of
/// routes. A frontend holds at most one vhost marked default.
pub struct Vhost {
    pub is_default: bool,
    pub domains: Vec<String>,
    pub mux: PathMux,
    pub counters: crate::counters::Counters,
}

/// Host-switch: dispatches on lowercased host (SNI or `Host` header,
/// port stripped) to a vhost, falling back to the configured default.
pub struct HostSwitch {
    handlers: HashMap<String, Arc<Vhost>>,
    default_handler: Option<Arc<Vhost>>,
}

pub enum HostMatch {
    Vhost(Arc<Vhost>),
    Forbidden,
}

impl HostSwitch {
    pub fn new(handlers: HashMap<String, Arc<Vhost>>, default_handler: Option<Arc<Vhost>>) -> Self {
        Self {
            handlers,
            default_handler,
        }
    }

    /// Build from a frontend's vhost configs. At most one vhost may be
    /// marked default; enforced by `FrontendConfig::validate`, not here.
    pub fn from_config(cfg: &FrontendConfig) -> Self {
        let mut handlers = HashMap::new();
        let mut default_handler = None;

        for vh in &cfg.hosts {
            let mut mux = PathMux::new();
            for handler in &vh.handlers {
                mux.insert(Route {
                    path: handler.path.clone(),
                    backend_name: handler.backend_name.clone(),
                    auth: handler.auth.clone(),
                    max_rate: handler.max_rate,
                    max_conn: handler.max_conn.unwrap_or(0),
                });
            }
            let vhost = Arc::new(Vhost {
                is_default: vh.default,
                domains: vh.domains.iter().map(|d| d.to_ascii_lowercase()).collect(),
                mux,
                counters: crate::counters::Counters::new(),
            });

            if vh.default {
                default_handler = Some(vhost.clone());
            }
            for domain in &vhost.domains {
                handlers.insert(domain.clone(), vhost.clone());
            }
        }

        Self::new(handlers, default_handler)
    }

    /// Compute the host key (TLS SNI, else the `Host` header), strip any
    /// port suffix, lowercase, and look up the vhost.
    pub fn dispatch(&self, host_header: &str, sni: Option<&str>) -> HostMatch {
        let raw = sni.unwrap_or(host_header);
        let stripped = raw.split(':').next().unwrap_or(raw);
        let key = stripped.to_ascii_lowercase();

        match self.handlers.get(&key) {
            Some(vhost) => HostMatch::Vhost(vhost.clone()),
            None => match &self.default_handler {
                Some(vhost) => HostMatch::Vhost(vhost.clone()),
                None => HostMatch::Forbidden,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vhost(domains: &[&str], is_default: bool) -> Arc<Vhost> {
        let mut mux = PathMux::new();
        mux.insert(Route {
            path: "/".to_string(),
            backend_name: "be1".to_string(),
            auth: None,
            max_rate: None,
            max_conn: 0,
        });
        Arc::new(Vhost {
            is_default,
            domains: domains.iter().map(|s| s.to_string()).collect(),
            mux,
            counters: crate::counters::Counters::new(),
        })
    }

    #[test]
    fn host_lookup_strips_port_and_lowercases() {
        let v = vhost(&["one.com"], false);
        let mut handlers = HashMap::new();
        handlers.insert("one.com".to_string(), v);
        let hs = HostSwitch::new(handlers, None);

        assert!(matches!(hs.dispatch("ONE.COM:8080", None), HostMatch::Vhost(_)));
    }

    #[test]
    fn unknown_host_without_default_is_forbidden() {
        let hs = HostSwitch::new(HashMap::new(), None);
        assert!(matches!(hs.dispatch("nope.com", None), HostMatch::Forbidden));
    }

    #[test]
    fn unknown_host_with_default_falls_back() {
        let v = vhost(&["_default"], true);
        let hs = HostSwitch::new(HashMap::new(), Some(v));
        assert!(matches!(hs.dispatch("anything.com", None), HostMatch::Vhost(_)));
    }

    #[test]
    fn sni_takes_priority_over_host_header() {
        let v = vhost(&["sni.com"], false);
        let mut handlers = HashMap::new();
        handlers.insert("sni.com".to_string(), v);
        let hs = HostSwitch::new(handlers, None);

        assert!(matches!(
            hs.dispatch("host-header.com", Some("sni.com")),
            HostMatch::Vhost(_)
        ));
    }
}
