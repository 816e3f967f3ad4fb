use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use hd_policy::PolicyConfig;
use hd_ratelimit::RateLimitConfig;
use hd_resolver::{CustomDnsConfig, ForwardConfig};
use hd_server::ServerConfig;

/// Aggregated configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HydraConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub custom: CustomDnsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl HydraConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            info!("no config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }
}
