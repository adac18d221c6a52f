#![forbid(unsafe_code)]

use std::env;
use std::ops::RangeInclusive;
use std::time::Duration;

use url::Url;

pub const HTTP_CONNECT_TIMEOUT_MS_DEFAULT: u64 = 3_000;
pub const HTTP_REQUEST_TIMEOUT_MS_DEFAULT: u64 = 10_000;

/// Base URL and timeouts shared by the registry and execution HTTP bridges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpBridgeConfig {
    pub endpoint: Url,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl HttpBridgeConfig {
    /// `None` when `endpoint_var` is unset, blank, or not an http(s) URL.
    pub fn from_env(endpoint_var: &str) -> Option<Self> {
        let raw = env::var(endpoint_var).ok()?;
        let endpoint = match parse_endpoint(&raw) {
            Some(url) => url,
            None => {
                if !raw.trim().is_empty() {
                    tracing::warn!(var = endpoint_var, value = %raw, "ignoring invalid bridge endpoint");
                }
                return None;
            }
        };
        Some(Self {
            endpoint,
            connect_timeout_ms: env_u64(
                "PULSE_HTTP_CONNECT_TIMEOUT_MS",
                100..=60_000,
                HTTP_CONNECT_TIMEOUT_MS_DEFAULT,
            ),
            request_timeout_ms: env_u64(
                "PULSE_HTTP_REQUEST_TIMEOUT_MS",
                100..=120_000,
                HTTP_REQUEST_TIMEOUT_MS_DEFAULT,
            ),
        })
    }

    pub fn with_endpoint(endpoint: Url) -> Self {
        Self {
            endpoint,
            connect_timeout_ms: HTTP_CONNECT_TIMEOUT_MS_DEFAULT,
            request_timeout_ms: HTTP_REQUEST_TIMEOUT_MS_DEFAULT,
        }
    }

    /// Resolves `path` (no leading slash) under the endpoint.
    pub fn url(&self, path: &str) -> Result<Url, url::ParseError> {
        self.endpoint.join(path)
    }

    pub fn agent(&self) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(self.connect_timeout_ms))
            .timeout_read(Duration::from_millis(self.request_timeout_ms))
            .timeout_write(Duration::from_millis(self.request_timeout_ms))
            .build()
    }
}

/// Accepts http(s) URLs only. The path always gains a trailing slash so `join` appends.
pub fn parse_endpoint(raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut url = Url::parse(trimmed).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return None;
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Some(url)
}

pub fn env_u64(var: &str, range: RangeInclusive<u64>, default: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| range.contains(v))
        .unwrap_or(default)
}

pub fn env_flag(var: &str) -> bool {
    env::var(var)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_bridge_01_endpoint_gains_trailing_slash_for_join() {
        let cfg = HttpBridgeConfig::with_endpoint(parse_endpoint("https://registry.local/api").unwrap());
        assert_eq!(
            cfg.url("v1/users/0xabc/status").unwrap().as_str(),
            "https://registry.local/api/v1/users/0xabc/status"
        );
    }

    #[test]
    fn at_bridge_02_rejects_non_http_and_blank_endpoints() {
        assert!(parse_endpoint("").is_none());
        assert!(parse_endpoint("   ").is_none());
        assert!(parse_endpoint("ftp://x.local").is_none());
        assert!(parse_endpoint("not a url").is_none());
        assert!(parse_endpoint("http://127.0.0.1:8545").is_some());
    }

    #[test]
    fn at_bridge_03_env_u64_falls_back_outside_range() {
        assert_eq!(env_u64("PULSE_TEST_UNSET_VAR_FOR_BRIDGE", 1..=10, 7), 7);
    }
}
