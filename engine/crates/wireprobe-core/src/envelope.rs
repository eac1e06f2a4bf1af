//! Uniform response envelope
//!
//! Every probe outcome becomes exactly one `Envelope`: either a success
//! carrying timing plus protocol fields, or a failure carrying an error
//! message. Building an envelope never performs I/O.

use crate::error::{Error, ErrorKind, Result};
use crate::target::ProbeTarget;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

/// Keys owned by the envelope itself; protocol payloads may not use them
const RESERVED_KEYS: &[&str] = &[
    "success",
    "error",
    "errorCode",
    "isCloudflare",
    "host",
    "port",
    "rtt",
    "connectTime",
];

/// Protocol-specific result fields, flattened into the envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert a serializable result struct into a payload
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => {
                if let Some(key) = map.keys().find(|k| RESERVED_KEYS.contains(&k.as_str())) {
                    return Err(Error::Internal(format!(
                        "payload field '{}' collides with the envelope",
                        key
                    )));
                }
                Ok(Self(map))
            }
            _ => Err(Error::Internal(String::from(
                "probe result must serialize to an object",
            ))),
        }
    }

    /// Add or replace a field; reserved envelope keys are ignored
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        if !RESERVED_KEYS.contains(&key) {
            self.0.insert(key.to_string(), value.into());
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

/// Connection timing captured by the transport
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timing {
    /// Dial start to transport established (TCP, plus TLS when enabled)
    pub connect_time: Duration,
    /// Last byte written to first byte of the reply, for the first exchange
    pub rtt: Option<Duration>,
}

/// The response body of every probe
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_cloudflare: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt: Option<f64>,

    /// Milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_time: Option<f64>,

    #[serde(flatten)]
    pub payload: Payload,

    /// HTTP status for the transport edge
    #[serde(skip)]
    pub status: u16,
}

impl Envelope {
    /// Successful probe. An empty payload still reports the probe as reachable.
    pub fn success(target: &ProbeTarget, timing: Timing, payload: Payload) -> Self {
        let payload = if payload.is_empty() {
            payload.with("reachable", true)
        } else {
            payload
        };

        Self {
            success: true,
            error: None,
            error_code: None,
            is_cloudflare: None,
            host: Some(target.host.clone()),
            port: Some(target.port),
            rtt: Some(millis(timing.rtt.unwrap_or(Duration::ZERO).min(target.timeout))),
            connect_time: Some(millis(timing.connect_time)),
            payload,
            status: 200,
        }
    }

    /// Failed probe. Host/port are echoed when they were known.
    pub fn failure(error: &Error, host: Option<String>, port: Option<u16>) -> Self {
        let kind = error.kind();
        Self {
            success: false,
            error: Some(error.to_string()),
            error_code: Some(error.code()),
            is_cloudflare: (kind == ErrorKind::Blocked).then_some(true),
            host,
            port,
            rtt: None,
            connect_time: None,
            payload: Payload::new(),
            status: kind.status(),
        }
    }

    /// Failure for a request that never produced a target
    pub fn from_error(error: &Error) -> Self {
        Self::failure(error, None, None)
    }

    /// Failure with an explicit status (routing errors such as 404/405)
    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            error_code: None,
            is_cloudflare: None,
            host: None,
            port: None,
            rtt: None,
            connect_time: None,
            payload: Payload::new(),
            status,
        }
    }

    /// Exactly one of {payload, error} is populated
    pub fn is_consistent(&self) -> bool {
        if self.success {
            self.error.is_none() && !self.payload.is_empty()
        } else {
            self.error.is_some() && self.payload.is_empty()
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({"success": false, "error": e.to_string()})
        })
    }
}

fn millis(d: Duration) -> f64 {
    (d.as_secs_f64() * 1_000_000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        #[serde(rename = "isZMTP")]
        is_zmtp: bool,
        version: String,
    }

    fn target() -> ProbeTarget {
        ProbeTarget::new("10.0.0.5", 5555, Duration::from_secs(3))
    }

    #[test]
    fn test_success_flattens_payload() {
        let payload = Payload::from_serialize(&Sample {
            is_zmtp: true,
            version: "3.0".into(),
        })
        .unwrap();
        let timing = Timing {
            connect_time: Duration::from_micros(1500),
            rtt: Some(Duration::from_millis(2)),
        };
        let envelope = Envelope::success(&target(), timing, payload);
        assert!(envelope.is_consistent());

        let json = envelope.to_json();
        assert_eq!(json["success"], true);
        assert_eq!(json["isZMTP"], true);
        assert_eq!(json["version"], "3.0");
        assert_eq!(json["connectTime"], 1.5);
        assert_eq!(json["rtt"], 2.0);
        assert!(json.get("error").is_none());
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_failure_has_no_payload() {
        let err = Error::timeout("connecting", 3000);
        let envelope = Envelope::failure(&err, Some("192.0.2.1".into()), Some(179));
        assert!(envelope.is_consistent());
        assert_eq!(envelope.status, 500);

        let json = envelope.to_json();
        assert_eq!(json["success"], false);
        assert_eq!(json["errorCode"], "TIMEOUT");
        assert!(json.get("rtt").is_none());
        assert!(json.get("isCloudflare").is_none());
    }

    #[test]
    fn test_blocked_sets_flag() {
        let err = Error::Blocked {
            host: "cloudflare.com".into(),
            reason: "destination is protected".into(),
        };
        let envelope = Envelope::failure(&err, Some("cloudflare.com".into()), None);
        assert_eq!(envelope.status, 403);
        assert_eq!(envelope.is_cloudflare, Some(true));
    }

    #[test]
    fn test_reserved_keys_rejected() {
        #[derive(Serialize)]
        struct Bad {
            host: String,
        }
        assert!(Payload::from_serialize(&Bad { host: "x".into() }).is_err());

        let mut payload = Payload::new();
        payload.insert("success", false);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_empty_payload_still_consistent() {
        let envelope = Envelope::success(&target(), Timing::default(), Payload::new());
        assert!(envelope.is_consistent());
        assert_eq!(envelope.payload.get("reachable"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_rtt_never_exceeds_timeout() {
        let timing = Timing {
            connect_time: Duration::ZERO,
            rtt: Some(Duration::from_secs(10)),
        };
        let envelope = Envelope::success(&target(), timing, Payload::new().with("x", 1));
        assert_eq!(envelope.rtt, Some(3000.0));
    }
}
