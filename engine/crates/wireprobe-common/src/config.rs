//! Configuration management for the probe service

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use wireprobe_core::{Error, ProbeLimits, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Probe execution limits
    #[serde(default)]
    pub probes: ProbeConfig,

    /// Protected destinations
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Merge with environment variables (WIREPROBE_ prefix)
    pub fn merge_env(mut self) -> Self {
        if let Ok(val) = std::env::var("WIREPROBE_BIND_ADDR") {
            self.server.bind_addr = val;
        }
        if let Ok(val) = std::env::var("WIREPROBE_DEFAULT_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.probes.default_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("WIREPROBE_MAX_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.probes.max_timeout_ms = n;
            }
        }
        if let Ok(val) = std::env::var("WIREPROBE_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("WIREPROBE_LOG_FORMAT") {
            self.logging.format = val;
        }

        self
    }

    /// Reject settings that would make every probe fail
    pub fn validate(&self) -> Result<()> {
        if self.probes.default_timeout_ms == 0 || self.probes.max_timeout_ms == 0 {
            return Err(Error::Configuration(String::from(
                "probe timeouts must be greater than zero",
            )));
        }
        if self.probes.default_timeout_ms > self.probes.max_timeout_ms {
            return Err(Error::Configuration(String::from(
                "default_timeout_ms exceeds max_timeout_ms",
            )));
        }
        Ok(())
    }

    /// Timeout bounds applied during request validation
    pub fn limits(&self) -> ProbeLimits {
        ProbeLimits {
            default_timeout: Duration::from_millis(self.probes.default_timeout_ms),
            max_timeout: Duration::from_millis(self.probes.max_timeout_ms),
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP surface binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    String::from("0.0.0.0:8080")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Probe execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Timeout for protocols without their own default
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Absolute cap on any requested timeout
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,

    /// Complete TLS handshakes with peers presenting untrusted certificates
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_timeout_ms() -> u64 {
    30000
}

fn default_true() -> bool {
    true
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            accept_invalid_certs: true,
        }
    }
}

/// Protected destination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Domain suffixes that may never be probed
    #[serde(default = "default_blocked_domains")]
    pub blocked_domains: Vec<String>,

    /// Networks (CIDR) that may never be probed
    #[serde(default = "default_blocked_cidrs")]
    pub blocked_cidrs: Vec<String>,

    /// Resolve hostnames and check their addresses against `blocked_cidrs`
    #[serde(default = "default_true")]
    pub resolve_hostnames: bool,

    /// Upper bound on the resolution done by the gate
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
}

fn default_blocked_domains() -> Vec<String> {
    [
        "cloudflare.com",
        "cloudflare.net",
        "cloudflare-dns.com",
        "cloudflareaccess.com",
        "cloudflarestorage.com",
        "workers.dev",
        "pages.dev",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Cloudflare's published edge ranges
fn default_blocked_cidrs() -> Vec<String> {
    [
        "173.245.48.0/20",
        "103.21.244.0/22",
        "103.22.200.0/22",
        "103.31.4.0/22",
        "141.101.64.0/18",
        "108.162.192.0/18",
        "190.93.240.0/20",
        "188.114.96.0/20",
        "197.234.240.0/22",
        "198.41.128.0/17",
        "162.158.0.0/15",
        "104.16.0.0/13",
        "104.24.0.0/14",
        "172.64.0.0/13",
        "131.0.72.0/22",
        "2400:cb00::/32",
        "2606:4700::/32",
        "2803:f800::/32",
        "2405:b500::/32",
        "2405:8100::/32",
        "2a06:98c0::/29",
        "2c0f:f248::/32",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_resolve_timeout_ms() -> u64 {
    1000
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            blocked_domains: default_blocked_domains(),
            blocked_cidrs: default_blocked_cidrs(),
            resolve_hostnames: true,
            resolve_timeout_ms: default_resolve_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    String::from("info")
}

fn default_log_format() -> String {
    String::from("pretty")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Builder for constructing Config
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server.bind_addr = addr.into();
        self
    }

    pub fn max_timeout_ms(mut self, ms: u64) -> Self {
        self.config.probes.max_timeout_ms = ms;
        self
    }

    pub fn default_timeout_ms(mut self, ms: u64) -> Self {
        self.config.probes.default_timeout_ms = ms;
        self
    }

    pub fn blocked_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.safety.blocked_domains.push(domain.into());
        self
    }

    pub fn resolve_hostnames(mut self, resolve: bool) -> Self {
        self.config.safety.resolve_hostnames = resolve;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:9000"

            [probes]
            max_timeout_ms = 10000

            [safety]
            blocked_domains = ["internal.example"]
            resolve_hostnames = false

            [logging]
            level = "debug"
            format = "json"
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.probes.max_timeout_ms, 10000);
        assert_eq!(config.probes.default_timeout_ms, 5000);
        assert_eq!(config.safety.blocked_domains, vec!["internal.example"]);
        assert!(!config.safety.blocked_cidrs.is_empty());
        assert!(!config.safety.resolve_hostnames);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert!(config
            .safety
            .blocked_domains
            .iter()
            .any(|d| d == "cloudflare.com"));
        assert_eq!(config.limits().max_timeout, Duration::from_millis(30000));
    }

    #[test]
    fn test_invalid_timeouts_rejected() {
        let toml = r#"
            [probes]
            default_timeout_ms = 60000
            max_timeout_ms = 1000
        "#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder()
            .bind_addr("127.0.0.1:0")
            .max_timeout_ms(8000)
            .blocked_domain("corp.example")
            .log_level("warn")
            .build();

        assert_eq!(config.server.bind_addr, "127.0.0.1:0");
        assert_eq!(config.limits().max_timeout, Duration::from_millis(8000));
        assert!(config.safety.blocked_domains.contains(&"corp.example".to_string()));
        assert_eq!(config.logging.level, "warn");
    }
}
