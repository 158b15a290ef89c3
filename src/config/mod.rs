pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a TOML or JSON file. Loaded once at
    /// startup into an immutable snapshot; there is no reload path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
            None => anyhow::bail!("config file has no extension, use .toml or .json"),
        };

        config.validate()?;
        tracing::info!(
            frontends = config.http_frontend.len(),
            backends = config.http_backend.len(),
            "loaded gateway configuration"
        );
        Ok(config)
    }
}
