use crate::auth::BasicAuthConfig;
use serde::Deserialize;
use std::collections::HashSet;

/// Reserved backend name that routes to the in-process stats snapshot
/// instead of dialing any upstream.
pub const INTERNAL_STATS_BACKEND: &str = "internalstats";

fn default_server_string() -> String {
    "backplane/0.1".to_string()
}

fn default_max_conn_rate() -> f64 {
    999_999.0
}

fn default_max_conns() -> usize {
    0
}

fn default_weight() -> u32 {
    1
}

fn default_period_ms() -> u64 {
    200
}

fn default_rtt_budget_ms() -> u64 {
    20
}

#[derive(Debug, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub http_frontend: Vec<FrontendConfig>,
    #[serde(default)]
    pub http_backend: Vec<BackendConfig>,
    #[serde(default)]
    pub swim: Option<SwimConfig>,
}

#[derive(Debug, Deserialize)]
pub struct FrontendConfig {
    pub name: String,
    pub bind_http: Option<String>,
    pub bind_https: Option<String>,
    #[serde(default)]
    pub ssl_cert: Vec<String>,
    pub ssl_cert_mask: Option<String>,
    #[serde(default = "default_server_string")]
    pub server_string: String,
    #[serde(default = "default_max_conn_rate")]
    pub max_conn_rate: f64,
    #[serde(default = "default_max_conn_rate")]
    pub ssl_max_conn_rate: f64,
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
    #[serde(default = "default_max_conns")]
    pub ssl_max_conns: usize,
    #[serde(default)]
    pub hosts: Vec<VhostConfig>,
}

#[derive(Debug, Deserialize)]
pub struct VhostConfig {
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct HandlerConfig {
    pub path: String,
    pub backend_name: String,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    pub max_rate: Option<f64>,
    pub max_conn: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    pub http_basic: BasicAuthConfig,
}

impl HandlerConfig {
    pub fn auth(&self) -> Option<BasicAuthConfig> {
        self.auth.as_ref().map(|a| a.http_basic.clone())
    }
}

#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default)]
    pub server: Vec<ServerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_conns")]
    pub maxconn: usize,
}

#[derive(Debug, Deserialize)]
pub struct SwimConfig {
    pub local_name: String,
    pub bind_addr: String,
    #[serde(default)]
    pub seed_nodes: Vec<String>,
    #[serde(default)]
    pub fabrics: Vec<FabricConfig>,
}

#[derive(Debug, Deserialize)]
pub struct FabricConfig {
    pub name: String,
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default = "default_rtt_budget_ms")]
    pub rtt_budget_ms: u64,
}

impl GatewayConfig {
    /// Validate the §6 rules: unique non-empty backend names, non-empty
    /// handler paths, handlers reference a resolvable backend name (or
    /// the reserved `internalstats`), at most one default vhost per
    /// frontend.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut backend_names = HashSet::new();
        for backend in &self.http_backend {
            if backend.name.is_empty() {
                anyhow::bail!("backend name cannot be empty");
            }
            if !backend_names.insert(backend.name.as_str()) {
                anyhow::bail!("duplicate backend name: {}", backend.name);
            }
        }

        for frontend in &self.http_frontend {
            let mut seen_default = false;
            for vhost in &frontend.hosts {
                if vhost.default {
                    if seen_default {
                        anyhow::bail!(
                            "frontend {} has more than one default vhost",
                            frontend.name
                        );
                    }
                    seen_default = true;
                }
                for handler in &vhost.handlers {
                    if handler.path.is_empty() {
                        anyhow::bail!("handler path cannot be empty (frontend {})", frontend.name);
                    }
                    if handler.backend_name != INTERNAL_STATS_BACKEND
                        && !backend_names.contains(handler.backend_name.as_str())
                    {
                        anyhow::bail!(
                            "handler {} references unknown backend {}",
                            handler.path,
                            handler.backend_name
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> GatewayConfig {
        GatewayConfig {
            http_frontend: vec![FrontendConfig {
                name: "main".to_string(),
                bind_http: Some("0.0.0.0:8080".to_string()),
                bind_https: None,
                ssl_cert: vec![],
                ssl_cert_mask: None,
                server_string: default_server_string(),
                max_conn_rate: default_max_conn_rate(),
                ssl_max_conn_rate: default_max_conn_rate(),
                max_conns: default_max_conns(),
                ssl_max_conns: default_max_conns(),
                hosts: vec![VhostConfig {
                    default: true,
                    domains: vec![],
                    handlers: vec![HandlerConfig {
                        path: "/".to_string(),
                        backend_name: "be1".to_string(),
                        auth: None,
                        max_rate: None,
                        max_conn: None,
                    }],
                }],
            }],
            http_backend: vec![BackendConfig {
                name: "be1".to_string(),
                server: vec![ServerConfig {
                    address: "127.0.0.1:9000".to_string(),
                    weight: 1,
                    maxconn: 0,
                }],
            }],
            swim: None,
        }
    }

    #[test]
    fn minimal_config_validates() {
        minimal_config().validate().unwrap();
    }

    #[test]
    fn duplicate_backend_name_fails_validation() {
        let mut cfg = minimal_config();
        cfg.http_backend.push(BackendConfig {
            name: "be1".to_string(),
            server: vec![],
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn handler_referencing_unknown_backend_fails_validation() {
        let mut cfg = minimal_config();
        cfg.http_frontend[0].hosts[0].handlers[0].backend_name = "nope".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn handler_referencing_internalstats_is_allowed() {
        let mut cfg = minimal_config();
        cfg.http_frontend[0].hosts[0].handlers[0].backend_name =
            INTERNAL_STATS_BACKEND.to_string();
        cfg.validate().unwrap();
    }

    #[test]
    fn two_default_vhosts_fail_validation() {
        let mut cfg = minimal_config();
        let second = VhostConfig {
            default: true,
            domains: vec!["extra.com".to_string()],
            handlers: vec![],
        };
        cfg.http_frontend[0].hosts.push(second);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_handler_path_fails_validation() {
        let mut cfg = minimal_config();
        cfg.http_frontend[0].hosts[0].handlers[0].path = String::new();
        assert!(cfg.validate().is_err());
    }
}
