//! Gateway configuration.
//!
//! Values are fixed when the gateway is constructed. Layers are applied in
//! order: built-in defaults, an optional JSON file named by
//! `GATEWAY_CONFIG`, then individual environment variables.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proxy::{ProxyError, Upstream};

/// Environment variable naming an optional JSON configuration file.
pub const CONFIG_FILE_ENV: &str = "GATEWAY_CONFIG";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid backend URL: {0}")]
    InvalidBackendUrl(#[source] ProxyError),

    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the listener binds to.
    pub listen_addr: String,
    pub backend: BackendConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub cors: CorsConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_owned(),
            backend: BackendConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `http://host[:port][/base]` of the service requests are forwarded to.
    pub url: String,
    /// Upper bound on one forwarded exchange, connect included.
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_owned(),
            timeout_secs: 30,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Parses [`url`](Self::url).
    pub fn upstream(&self) -> Result<Upstream, ConfigError> {
        Upstream::parse(&self.url).map_err(ConfigError::InvalidBackendUrl)
    }
}

/// Per-client token bucket parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained admissions per second per client.
    pub requests_per_second: u32,
    /// Bucket capacity; the largest burst a rested client may send.
    pub burst: u32,
    /// Clients unseen for longer than this are forgotten.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst: 20,
            idle_timeout_secs: 300,
            sweep_interval_secs: 300,
        }
    }
}

impl RateLimitConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When `false` the cache stage is left out of the pipeline.
    pub enabled: bool,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Cross-origin policy applied to proxied responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins; `"*"` admits every origin.
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    /// `Access-Control-Max-Age` sent on preflight responses.
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .map(str::to_owned)
                .to_vec(),
            allowed_headers: vec!["Content-Type".to_owned(), "Authorization".to_owned()],
            max_age_secs: 3600,
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from the process environment and validates it.
    ///
    /// # Errors
    ///
    /// Any unreadable file, unparsable value, or failed validation.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`load`](Self::load), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_FILE_ENV) {
            Some(path) => {
                tracing::info!(path = %path, "loading configuration file");
                Self::from_json_file(path)?
            }
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
            path: path.display().to_string(),
            source,
        })
    }

    /// Applies the individual environment overrides.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = lookup("BACKEND_URL") {
            self.backend.url = url;
        }
        if let Some(port) = parse_var::<u16>(&lookup, "GATEWAY_PORT")? {
            self.listen_addr = format!("0.0.0.0:{port}");
        }
        if let Some(v) = parse_var(&lookup, "RATE_LIMIT_RPS")? {
            self.rate_limit.requests_per_second = v;
        }
        if let Some(v) = parse_var(&lookup, "RATE_LIMIT_BURST")? {
            self.rate_limit.burst = v;
        }
        if let Some(v) = parse_var(&lookup, "RATE_LIMIT_IDLE_SECS")? {
            self.rate_limit.idle_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "CACHE_ENABLED")? {
            self.cache.enabled = v;
        }
        if let Some(v) = parse_var(&lookup, "CACHE_TTL_SECS")? {
            self.cache.ttl_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "CACHE_SWEEP_SECS")? {
            self.cache.sweep_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "UPSTREAM_TIMEOUT_SECS")? {
            self.backend.timeout_secs = v;
        }
        Ok(())
    }

    /// Rejects values the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend.upstream()?;

        let positive = [
            ("rate_limit.requests_per_second", u64::from(self.rate_limit.requests_per_second)),
            ("rate_limit.burst", u64::from(self.rate_limit.burst)),
            ("rate_limit.idle_timeout_secs", self.rate_limit.idle_timeout_secs),
            ("rate_limit.sweep_interval_secs", self.rate_limit.sweep_interval_secs),
            ("cache.ttl_secs", self.cache.ttl_secs),
            ("cache.sweep_interval_secs", self.cache.sweep_interval_secs),
            ("backend.timeout_secs", self.backend.timeout_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_owned(),
                    value: value.to_string(),
                    reason: "must be greater than zero".to_owned(),
                });
            }
        }

        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue {
                key: "listen_addr".to_owned(),
                value: self.listen_addr.clone(),
                reason: "must be an ip:port socket address".to_owned(),
            });
        }

        Ok(())
    }

    /// Human-readable rate limit, as reported by the stats endpoint.
    pub fn rate_limit_summary(&self) -> String {
        format!(
            "{} req/sec per client, burst {}",
            self.rate_limit.requests_per_second, self.rate_limit.burst
        )
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_owned(),
            value: raw.clone(),
            reason: e.to_string(),
        })
}
