//! Raw probe requests as they arrive from the transport edge
//!
//! A `RawRequest` is an untyped JSON object (from a POST body or GET query
//! string). Protocol validators pull typed, range-checked fields out of it;
//! codecs only ever see the validated structs produced that way.

use crate::error::{Error, Result};
use crate::target::{validate_host, validate_port, validate_timeout, ProbeLimits, ProbeTarget};
use serde_json::{Map, Value};
use std::time::Duration;

/// Untyped request fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRequest {
    fields: Map<String, Value>,
}

impl RawRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON body; anything other than an object is rejected
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            Value::Null => Ok(Self::default()),
            _ => Err(Error::InvalidBody(String::from(
                "request body must be a JSON object",
            ))),
        }
    }

    /// Build from query-string pairs; every value stays a string
    pub fn from_query<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), Value::String(v.into())))
            .collect();
        Self { fields }
    }

    /// Set a field, replacing any previous value
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Field value, treating JSON null and empty strings as absent
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.fields.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(v) => Some(v),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// String field; numbers and booleans are accepted in their textual form
    pub fn str_field(&self, key: &str) -> Result<Option<String>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(Error::validation(format!("{} must be a string", key))),
        }
    }

    /// Integer field, accepting JSON numbers or numeric strings
    pub fn i64_field(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| Error::validation(format!("{} must be an integer", key))),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Error::validation(format!("{} must be an integer", key))),
            Some(_) => Err(Error::validation(format!("{} must be an integer", key))),
        }
    }

    /// Integer field constrained to `min..=max`
    pub fn ranged_field(&self, key: &str, min: i64, max: i64) -> Result<Option<i64>> {
        match self.i64_field(key)? {
            None => Ok(None),
            Some(v) if (min..=max).contains(&v) => Ok(Some(v)),
            Some(_) => Err(Error::validation(format!(
                "{} must be between {} and {}",
                key, min, max
            ))),
        }
    }

    pub fn bool_field(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                _ => Err(Error::validation(format!("{} must be a boolean", key))),
            },
            Some(Value::Number(n)) => Ok(Some(n.as_i64() != Some(0))),
            Some(_) => Err(Error::validation(format!("{} must be a boolean", key))),
        }
    }

    /// Object field; a string holding a JSON object is also accepted
    pub fn object_field(&self, key: &str) -> Result<Option<Map<String, Value>>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map.clone())),
            Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => Ok(Some(map)),
                _ => Err(Error::validation(format!("{} must be a JSON object", key))),
            },
            Some(_) => Err(Error::validation(format!("{} must be a JSON object", key))),
        }
    }

    /// List of strings, given as a JSON array or a comma separated string
    pub fn string_list(&self, key: &str) -> Result<Vec<String>> {
        match self.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    _ => Err(Error::validation(format!("{} must contain only strings", key))),
                })
                .collect(),
            Some(Value::String(s)) => Ok(s
                .split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()),
            Some(_) => Err(Error::validation(format!("{} must be a list of strings", key))),
        }
    }

    /// Required host field, validated
    pub fn host_field(&self, key: &str) -> Result<String> {
        match self.str_field(key)? {
            Some(host) => validate_host(&host),
            None => Err(Error::validation(format!("Missing required parameter: {}", key))),
        }
    }

    /// Port field with an optional protocol default
    pub fn port_field(&self, key: &str, default: Option<u16>) -> Result<u16> {
        match self.i64_field(key) {
            Ok(Some(port)) => validate_port(port),
            Ok(None) => default
                .ok_or_else(|| Error::validation(format!("Missing required parameter: {}", key))),
            Err(_) => Err(Error::validation("Port must be between 1 and 65535")),
        }
    }

    /// Timeout in milliseconds, defaulted and capped
    pub fn timeout(&self, default: Duration, limits: &ProbeLimits) -> Result<Duration> {
        validate_timeout(self.i64_field("timeout")?, default, limits)
    }

    /// The common `{host, port, timeout}` triple
    pub fn target(
        &self,
        default_port: Option<u16>,
        default_timeout: Option<Duration>,
        limits: &ProbeLimits,
    ) -> Result<ProbeTarget> {
        let host = self.host_field("host")?;
        let port = self.port_field("port", default_port)?;
        let timeout = self.timeout(default_timeout.unwrap_or(limits.default_timeout), limits)?;
        Ok(ProbeTarget::new(host, port, timeout))
    }

    /// The raw `host` value, for envelopes built before validation succeeded
    pub fn raw_host(&self) -> Option<String> {
        self.str_field("host").ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_requires_object() {
        assert!(RawRequest::from_json(json!({"host": "a"})).is_ok());
        assert!(RawRequest::from_json(json!([1, 2])).is_err());
        assert!(RawRequest::from_json(Value::Null).is_ok());
    }

    #[test]
    fn test_target_with_defaults() {
        let raw = RawRequest::from_json(json!({"host": "10.0.0.5"})).unwrap();
        let target = raw.target(Some(179), None, &ProbeLimits::default()).unwrap();
        assert_eq!(target.port, 179);
        assert_eq!(target.timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_port_required_without_default() {
        let raw = RawRequest::from_json(json!({"host": "proxy.local"})).unwrap();
        let err = raw.target(None, None, &ProbeLimits::default()).unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn test_port_out_of_range() {
        for port in [json!(0), json!(65536), json!(-5), json!("99999"), json!("abc")] {
            let raw = RawRequest::from_json(json!({"host": "a.b", "port": port})).unwrap();
            let err = raw.target(Some(22), None, &ProbeLimits::default()).unwrap_err();
            assert_eq!(err.to_string(), "Port must be between 1 and 65535");
        }
    }

    #[test]
    fn test_query_values_parse() {
        let raw = RawRequest::from_query(vec![
            ("host", "example.com"),
            ("port", "8080"),
            ("timeout", "2500"),
            ("tls", "true"),
        ]);
        let target = raw.target(Some(80), None, &ProbeLimits::default()).unwrap();
        assert_eq!(target.port, 8080);
        assert_eq!(target.timeout, Duration::from_millis(2500));
        assert_eq!(raw.bool_field("tls").unwrap(), Some(true));
    }

    #[test]
    fn test_string_list_forms() {
        let raw = RawRequest::new()
            .with("a", json!(["x", "y"]))
            .with("b", "x, y ,");
        assert_eq!(raw.string_list("a").unwrap(), vec!["x", "y"]);
        assert_eq!(raw.string_list("b").unwrap(), vec!["x", "y"]);
        assert!(raw.string_list("missing").unwrap().is_empty());
    }

    #[test]
    fn test_ranged_field() {
        let raw = RawRequest::new().with("localAS", 70000);
        assert!(raw.ranged_field("localAS", 1, 65535).is_err());
        let raw = RawRequest::new().with("localAS", 65001);
        assert_eq!(raw.ranged_field("localAS", 1, 65535).unwrap(), Some(65001));
    }
}
