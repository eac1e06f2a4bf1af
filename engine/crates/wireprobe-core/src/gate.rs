//! Safety gate interface
//!
//! The gate is consulted after validation and before any socket is opened.
//! Implementations are built once at startup and shared read-only.

use async_trait::async_trait;

/// Verdict for one destination host
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GateDecision {
    pub blocked: bool,
    pub reason: Option<String>,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
        }
    }
}

/// Vetoes destinations before the transport is invoked
#[async_trait]
pub trait HostGate: Send + Sync {
    async fn check_host(&self, host: &str) -> GateDecision;
}

/// Gate that never blocks (tests and trusted deployments)
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl HostGate for AllowAll {
    async fn check_host(&self, _host: &str) -> GateDecision {
        GateDecision::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all() {
        assert!(!AllowAll.check_host("cloudflare.com").await.blocked);
    }

    #[test]
    fn test_block_reason() {
        let decision = GateDecision::block("protected network");
        assert!(decision.blocked);
        assert_eq!(decision.reason.as_deref(), Some("protected network"));
    }
}
