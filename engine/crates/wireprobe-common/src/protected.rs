//! Protected-host gate
//!
//! Destinations matching a blocked domain suffix or falling inside a blocked
//! network are vetoed before any socket is opened. The lists come from the
//! `[safety]` config section and never change after startup.

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};
use wireprobe_core::{Error, GateDecision, HostGate, Result};

use crate::config::SafetyConfig;

/// An IPv4 or IPv6 network in CIDR form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    /// Parse `a.b.c.d/n` or `x:y::/n`; a bare address is a host route
    pub fn parse(cidr: &str) -> Result<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let addr: IpAddr = addr
            .parse()
            .map_err(|_| Error::Configuration(format!("Invalid IP in CIDR: {}", cidr)))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| Error::Configuration(format!("Invalid prefix in CIDR: {}", cidr)))?,
            None => max,
        };
        if prefix > max {
            return Err(Error::Configuration(format!(
                "Invalid prefix length: {}",
                prefix
            )));
        }

        Ok(Self { addr, prefix })
    }

    /// Check whether `ip` falls inside this network
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix)
                };
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix)
                };
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            (IpAddr::V4(_), IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => self.contains(&IpAddr::V4(v4)),
                None => false,
            },
            _ => false,
        }
    }
}

/// Config-driven implementation of the safety gate
#[derive(Debug, Clone)]
pub struct ProtectedHosts {
    domains: Vec<String>,
    networks: Vec<IpNetwork>,
    resolve_hostnames: bool,
    resolve_timeout: Duration,
}

impl ProtectedHosts {
    pub fn from_config(config: &SafetyConfig) -> Result<Self> {
        let networks = config
            .blocked_cidrs
            .iter()
            .map(|cidr| IpNetwork::parse(cidr))
            .collect::<Result<Vec<_>>>()?;

        let domains = config
            .blocked_domains
            .iter()
            .map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();

        Ok(Self {
            domains,
            networks,
            resolve_hostnames: config.resolve_hostnames,
            resolve_timeout: Duration::from_millis(config.resolve_timeout_ms),
        })
    }

    fn matches_domain(&self, host: &str) -> Option<&str> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.domains
            .iter()
            .find(|d| host == **d || host.ends_with(&format!(".{}", d)))
            .map(|d| d.as_str())
    }

    fn matches_network(&self, ip: &IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(ip))
    }

    /// Addresses for `host`; failures and slow resolvers yield nothing
    async fn resolve(&self, host: &str) -> Vec<IpAddr> {
        let lookup = tokio::net::lookup_host((host, 0));
        match timeout(self.resolve_timeout, lookup).await {
            Ok(Ok(addrs)) => addrs.map(|a| a.ip()).collect(),
            Ok(Err(e)) => {
                debug!("Gate could not resolve {}: {}", host, e);
                Vec::new()
            }
            Err(_) => {
                debug!("Gate resolution of {} timed out", host);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl HostGate for ProtectedHosts {
    async fn check_host(&self, host: &str) -> GateDecision {
        if let Some(domain) = self.matches_domain(host) {
            info!("Blocked probe to {} (protected domain {})", host, domain);
            return GateDecision::block(format!(
                "{} is behind a protected network ({}); probing it is not allowed",
                host, domain
            ));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            if self.matches_network(&ip) {
                info!("Blocked probe to {} (protected network)", host);
                return GateDecision::block(format!(
                    "{} is inside a protected network; probing it is not allowed",
                    host
                ));
            }
            return GateDecision::allow();
        }

        if self.resolve_hostnames && !self.networks.is_empty() {
            if let Some(ip) = self
                .resolve(host)
                .await
                .into_iter()
                .find(|ip| self.matches_network(ip))
            {
                info!("Blocked probe to {} (resolves to protected {})", host, ip);
                return GateDecision::block(format!(
                    "{} resolves to {}, inside a protected network; probing it is not allowed",
                    host, ip
                ));
            }
        }

        GateDecision::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> ProtectedHosts {
        let config = SafetyConfig {
            resolve_hostnames: false,
            ..SafetyConfig::default()
        };
        ProtectedHosts::from_config(&config).unwrap()
    }

    #[test]
    fn test_parse_and_contains_v4() {
        let net = IpNetwork::parse("104.16.0.0/13").unwrap();
        assert!(net.contains(&"104.16.1.1".parse().unwrap()));
        assert!(net.contains(&"104.23.255.255".parse().unwrap()));
        assert!(!net.contains(&"104.24.0.1".parse().unwrap()));
        assert!(!net.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_parse_and_contains_v6() {
        let net = IpNetwork::parse("2606:4700::/32").unwrap();
        assert!(net.contains(&"2606:4700:10::6816:1".parse().unwrap()));
        assert!(!net.contains(&"2606:4701::1".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_addresses() {
        let net = IpNetwork::parse("104.16.0.0/13").unwrap();
        assert!(net.contains(&"::ffff:104.16.0.1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_cidrs() {
        assert!(IpNetwork::parse("10.0.0.0/33").is_err());
        assert!(IpNetwork::parse("nonsense/8").is_err());
        assert!(IpNetwork::parse("10.0.0.0/x").is_err());
        assert_eq!(IpNetwork::parse("10.0.0.1").unwrap().prefix, 32);
    }

    #[tokio::test]
    async fn test_blocks_cloudflare_domain() {
        let gate = gate();
        assert!(gate.check_host("cloudflare.com").await.blocked);
        assert!(gate.check_host("www.Cloudflare.com.").await.blocked);
        assert!(!gate.check_host("notcloudflare.com").await.blocked);
        assert!(!gate.check_host("example.com").await.blocked);
    }

    #[tokio::test]
    async fn test_blocks_protected_ip_literal() {
        let gate = gate();
        let decision = gate.check_host("104.16.132.229").await;
        assert!(decision.blocked);
        assert!(decision.reason.unwrap().contains("protected"));
        assert!(!gate.check_host("192.0.2.1").await.blocked);
    }
}
