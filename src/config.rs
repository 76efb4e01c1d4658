//! Runtime configuration.
//!
//! Values are read from the environment exactly once at startup and carried
//! as plain values from there on; nothing in the library reads `env::var`
//! behind the caller's back.

use crate::job::PollConfig;
use anyhow::{bail, Context, Result};
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// The downstream document-extraction service.
#[derive(Clone)]
pub struct ServiceConfig {
    /// Base URL of the service, e.g. `https://api.cloud.llamaindex.ai`.
    pub base_url: String,
    /// Alternate socket address used when the primary hostname cannot be
    /// reached (DNS outages). The request still carries the original
    /// hostname so virtual hosting routes correctly.
    pub fallback_addr: Option<SocketAddr>,
    pub api_key: String,
    pub timeout: Duration,
    /// Language hint forwarded to the parser.
    pub language: String,
    pub premium_mode: bool,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("LLAMA_CLOUD_API_KEY")
            .context("LLAMA_CLOUD_API_KEY must be set in the environment")?;
        if api_key.trim().is_empty() {
            bail!("LLAMA_CLOUD_API_KEY is empty");
        }
        let fallback_addr = match env::var("PARSE_FALLBACK_ADDR") {
            Ok(raw) => Some(parse_fallback_addr(&raw)?),
            Err(_) => None,
        };
        Ok(ServiceConfig {
            base_url: env::var("PARSE_BASE_URL")
                .unwrap_or_else(|_| "https://api.cloud.llamaindex.ai".to_string()),
            fallback_addr,
            api_key,
            timeout: Duration::from_secs(env_var_u64("PARSE_TIMEOUT_SECS", 30)),
            language: env::var("PARSE_LANG").unwrap_or_else(|_| "en".to_string()),
            premium_mode: env_var_bool("PARSE_PREMIUM", true),
        })
    }

    /// Hostname component of `base_url`, needed to pin DNS for the fallback
    /// client.
    pub fn host(&self) -> Result<String> {
        let url = url::Url::parse(&self.base_url)
            .with_context(|| format!("invalid PARSE_BASE_URL: {}", self.base_url))?;
        url.host_str()
            .map(str::to_string)
            .context("PARSE_BASE_URL has no host")
    }
}

// The bearer secret must never reach logs.
impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("base_url", &self.base_url)
            .field("fallback_addr", &self.fallback_addr)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("language", &self.language)
            .field("premium_mode", &self.premium_mode)
            .finish()
    }
}

/// Whole-application configuration for the API server and CLI.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub poll: PollConfig,
    /// Parallel outbound calls for batch uploads.
    pub max_concurrency: usize,
    /// Include diagnostic detail in error responses.
    pub dev_mode: bool,
    /// Optional inbound `X-API-Key` requirement.
    pub api_key: Option<String>,
    pub bind_addr: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(AppConfig {
            service: ServiceConfig::from_env()?,
            poll: PollConfig {
                interval: Duration::from_millis(env_var_u64("POLL_INTERVAL_MS", 2000)),
                max_attempts: env_var_u64("POLL_MAX_ATTEMPTS", 60) as u32,
            },
            max_concurrency: env_var_u64("MAX_CONCURRENCY", 4) as usize,
            dev_mode: env_var_bool("DEV_MODE", false),
            api_key: env::var("API_KEY").ok(),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
        })
    }
}

fn parse_fallback_addr(raw: &str) -> Result<SocketAddr> {
    // Accept both "ip:port" and a bare IP (implies 443).
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    format!("{raw}:443")
        .parse()
        .with_context(|| format!("invalid PARSE_FALLBACK_ADDR: {raw}"))
}

fn env_var_u64(key: &str, def: u64) -> u64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(def)
}

fn env_var_bool(key: &str, def: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"),
        Err(_) => def,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            base_url: "https://api.cloud.llamaindex.ai".to_string(),
            fallback_addr: Some("203.0.113.10:443".parse().unwrap()),
            api_key: "llx-secret".to_string(),
            timeout: Duration::from_secs(30),
            language: "en".to_string(),
            premium_mode: true,
        }
    }

    #[test]
    fn debug_output_redacts_the_secret() {
        let rendered = format!("{:?}", test_config());
        assert!(!rendered.contains("llx-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn host_is_extracted_from_base_url() {
        assert_eq!(test_config().host().unwrap(), "api.cloud.llamaindex.ai");
    }

    #[test]
    fn bare_ip_fallback_addr_defaults_to_443() {
        let addr = parse_fallback_addr("203.0.113.10").unwrap();
        assert_eq!(addr.port(), 443);
        let addr = parse_fallback_addr("203.0.113.10:8443").unwrap();
        assert_eq!(addr.port(), 8443);
    }
}
