#![forbid(unsafe_code)]

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use pulse_os::bridge::{env_flag, env_u64, HttpBridgeConfig};
use pulse_os::execution::EXECUTION_LOOPBACK_ENV;
use pulse_os::registry::REGISTRY_ENDPOINT_ENV;
use pulse_os::{ExecutionHttpConfig, RedemptionConfig, SessionKey};
use pulse_storage::StorageError;

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:3001";
pub const DISTRIBUTION_WORKER_INTERVAL_MS_DEFAULT: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("PULSE_HTTP_BIND '{value}' is not a socket address: {reason}")]
    InvalidBind { value: String, reason: String },
    #[error("store could not be opened: {0}")]
    Store(#[from] StorageError),
}

/// Process configuration, read once at start-up.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub bind: SocketAddr,
    pub store_path: PathBuf,
    pub registry: Option<HttpBridgeConfig>,
    pub execution: Option<ExecutionHttpConfig>,
    pub session_key: Option<SessionKey>,
    /// Settle every batch in-process when no execution endpoint is set. Development only.
    pub execution_loopback: bool,
    pub redemption: RedemptionConfig,
    pub distribution_worker_enabled: bool,
    pub distribution_worker_interval_ms: u64,
}

impl AdapterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_raw = env::var("PULSE_HTTP_BIND")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());
        let bind = bind_raw
            .parse::<SocketAddr>()
            .map_err(|err| ConfigError::InvalidBind {
                value: bind_raw.clone(),
                reason: err.to_string(),
            })?;
        let store_path = env::var("PULSE_STORE_PATH")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_store_path);

        Ok(Self {
            bind,
            store_path,
            registry: HttpBridgeConfig::from_env(REGISTRY_ENDPOINT_ENV),
            execution: ExecutionHttpConfig::from_env(),
            session_key: SessionKey::from_env(),
            execution_loopback: env_flag(EXECUTION_LOOPBACK_ENV),
            redemption: RedemptionConfig::from_env(),
            distribution_worker_enabled: env_flag("PULSE_DISTRIBUTION_WORKER_ENABLED"),
            distribution_worker_interval_ms: env_u64(
                "PULSE_DISTRIBUTION_WORKER_INTERVAL_MS",
                1_000..=86_400_000,
                DISTRIBUTION_WORKER_INTERVAL_MS_DEFAULT,
            ),
        })
    }
}

pub fn default_store_path() -> PathBuf {
    env::temp_dir().join("pulsekeeper").join("pulse_store.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_config_01_default_store_path_is_under_temp_dir() {
        let p = default_store_path();
        assert!(p.starts_with(env::temp_dir()));
        assert!(p.ends_with("pulsekeeper/pulse_store.jsonl"));
    }

    #[test]
    fn at_config_02_default_bind_parses() {
        assert!(DEFAULT_HTTP_BIND.parse::<SocketAddr>().is_ok());
    }
}
