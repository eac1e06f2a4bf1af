//! Probe target definitions and the field validators shared by every protocol

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

/// Longest DNS name we accept
const MAX_HOST_LEN: usize = 253;

/// Characters that never appear in a hostname or address literal
const FORBIDDEN_HOST_CHARS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '\\', '\'', '"', '(', ')', '{', '}', '*', '?', '!', '#',
    '%', '^', '~', '=', ',', '/', '@',
];

/// A validated destination: where to connect and how long the whole probe may take
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    /// Hostname or IP literal (IPv6 without brackets)
    pub host: String,
    /// TCP port, always within 1..=65535
    pub port: u16,
    /// Deadline for connect + handshake
    pub timeout: Duration,
    /// Wrap the TCP stream in TLS before the handshake
    pub tls: bool,
}

impl ProbeTarget {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            tls: false,
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

impl std::fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address())
    }
}

/// Engine-wide bounds applied while validating requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeLimits {
    /// Timeout used when a protocol does not define its own
    pub default_timeout: Duration,
    /// Absolute cap on any requested timeout
    pub max_timeout: Duration,
}

impl Default for ProbeLimits {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(5000),
            max_timeout: Duration::from_millis(30000),
        }
    }
}

fn host_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._:\-]+$").expect("static host pattern"))
}

/// Validate a hostname or IP literal, returning it without IPv6 brackets
pub fn validate_host(raw: &str) -> Result<String> {
    let host = raw.trim();
    if host.is_empty() {
        return Err(Error::validation("Missing required parameter: host"));
    }
    if host.len() > MAX_HOST_LEN {
        return Err(Error::validation(format!(
            "Host exceeds {} characters",
            MAX_HOST_LEN
        )));
    }
    if host
        .chars()
        .any(|c| c.is_control() || c.is_whitespace() || FORBIDDEN_HOST_CHARS.contains(&c))
    {
        return Err(Error::validation("Host contains invalid characters"));
    }

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if !host_pattern().is_match(host) {
        return Err(Error::validation("Invalid host format"));
    }
    if host.contains(':') && host.parse::<IpAddr>().is_err() {
        return Err(Error::validation("Invalid host format"));
    }
    if host.starts_with('-') || host.starts_with('.') || host.contains("..") {
        return Err(Error::validation("Invalid host format"));
    }

    Ok(host.to_string())
}

/// Validate a port number; 0 and anything above 65535 are rejected
pub fn validate_port(value: i64) -> Result<u16> {
    if !(1..=65535).contains(&value) {
        return Err(Error::validation("Port must be between 1 and 65535"));
    }
    Ok(value as u16)
}

/// Resolve the requested timeout against the protocol default and the engine cap
pub fn validate_timeout(
    requested_ms: Option<i64>,
    default: Duration,
    limits: &ProbeLimits,
) -> Result<Duration> {
    let timeout = match requested_ms {
        None => default,
        Some(ms) if ms <= 0 => {
            return Err(Error::validation("Timeout must be a positive number of milliseconds"))
        }
        Some(ms) => Duration::from_millis(ms as u64),
    };
    Ok(timeout.min(limits.max_timeout))
}

/// Check `value` against `pattern`, failing with `message`
pub fn validate_pattern(value: &str, pattern: &Regex, message: &str) -> Result<()> {
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(Error::validation(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_hosts() {
        assert_eq!(validate_host("example.com").unwrap(), "example.com");
        assert_eq!(validate_host("192.168.1.1").unwrap(), "192.168.1.1");
        assert_eq!(validate_host("[::1]").unwrap(), "::1");
        assert_eq!(validate_host("fe80::1").unwrap(), "fe80::1");
        assert_eq!(validate_host("  mq-01.internal ").unwrap(), "mq-01.internal");
    }

    #[test]
    fn test_invalid_hosts() {
        assert!(validate_host("").is_err());
        assert!(validate_host("host;rm -rf").is_err());
        assert!(validate_host("host name").is_err());
        assert!(validate_host("evil`id`").is_err());
        assert!(validate_host("a\nb").is_err());
        assert!(validate_host("not:an:ip:zz").is_err());
        assert!(validate_host("..").is_err());
        assert!(validate_host(&"a".repeat(300)).is_err());
    }

    #[test]
    fn test_port_range() {
        assert_eq!(validate_port(1).unwrap(), 1);
        assert_eq!(validate_port(65535).unwrap(), 65535);
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());
        assert!(validate_port(-1).is_err());

        let err = validate_port(70000).unwrap_err();
        assert_eq!(err.to_string(), "Port must be between 1 and 65535");
    }

    #[test]
    fn test_timeout_defaults_and_cap() {
        let limits = ProbeLimits::default();
        let default = Duration::from_millis(5000);

        assert_eq!(validate_timeout(None, default, &limits).unwrap(), default);
        assert_eq!(
            validate_timeout(Some(3000), default, &limits).unwrap(),
            Duration::from_millis(3000)
        );
        assert_eq!(
            validate_timeout(Some(600_000), default, &limits).unwrap(),
            limits.max_timeout
        );
        assert!(validate_timeout(Some(0), default, &limits).is_err());
    }

    #[test]
    fn test_target_address() {
        let v4 = ProbeTarget::new("10.0.0.1", 179, Duration::from_secs(1));
        assert_eq!(v4.address(), "10.0.0.1:179");

        let v6 = ProbeTarget::new("::1", 5900, Duration::from_secs(1));
        assert_eq!(v6.address(), "[::1]:5900");
    }
}
