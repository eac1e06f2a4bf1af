//! RabbitMQ: AMQP 0-9-1 Connection.Start and the management HTTP API
//!
//! The AMQP probe sends the protocol header and decodes the server's
//! Connection.Start method frame without answering it. The `api` action is
//! a read-only GET against the management plugin, restricted to `/api/`
//! paths.

use async_trait::async_trait;
use base64::prelude::*;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use wireprobe_core::{validate_pattern, Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{ByteReader, Decoded, FrameDecoder, MAX_FRAME_LEN};
use crate::http::{self, HttpRequest};
use crate::protocols::{pattern, tls_target};
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_TLS_PORT: u16 = 5671;
pub const MANAGEMENT_PORT: u16 = 15672;
pub const MANAGEMENT_TLS_PORT: u16 = 15671;

pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

const FRAME_METHOD: u8 = 1;
const FRAME_END: u8 = 0xCE;
const MAX_BODY_PREVIEW: usize = 64 * 1024;

/// What the broker sent first
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Frame {
        kind: u8,
        channel: u16,
        payload: Vec<u8>,
    },
    /// The broker rejected our version and announced its own
    ProtocolHeader([u8; 8]),
}

/// Frames AMQP frames, or the 8-byte header a broker sends back on version mismatch
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpDecoder;

impl FrameDecoder for AmqpDecoder {
    type Frame = Incoming;

    fn decode(&self, buf: &[u8]) -> Decoded<Incoming> {
        if buf.starts_with(b"AMQP") {
            if buf.len() < 8 {
                return Decoded::Incomplete;
            }
            let mut header = [0u8; 8];
            header.copy_from_slice(&buf[..8]);
            return Decoded::complete(Incoming::ProtocolHeader(header), 8);
        }
        if buf.len() < 7 {
            return Decoded::Incomplete;
        }
        let size = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;
        if size > MAX_FRAME_LEN {
            return Decoded::invalid(format!("frame size {} exceeds limit", size));
        }
        let total = 7 + size + 1;
        if buf.len() < total {
            return Decoded::Incomplete;
        }
        if buf[total - 1] != FRAME_END {
            return Decoded::invalid(format!("bad frame end octet {:#04x}", buf[total - 1]));
        }
        Decoded::complete(
            Incoming::Frame {
                kind: buf[0],
                channel: u16::from_be_bytes([buf[1], buf[2]]),
                payload: buf[7..7 + size].to_vec(),
            },
            total,
        )
    }

    fn stage(&self) -> &'static str {
        "awaiting Connection.Start"
    }
}

/// Decoded Connection.Start arguments
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStart {
    pub version_major: u8,
    pub version_minor: u8,
    pub server_properties: Map<String, Value>,
    pub mechanisms: Vec<String>,
    pub locales: Vec<String>,
}

pub fn decode_connection_start(payload: &[u8]) -> Result<ConnectionStart> {
    let mut r = ByteReader::new("AMQP", payload);
    let class_id = r.u16_be("class id")?;
    let method_id = r.u16_be("method id")?;
    if (class_id, method_id) != (10, 10) {
        return Err(r.error(format!(
            "expected Connection.Start (10,10), got ({},{})",
            class_id, method_id
        )));
    }
    let version_major = r.u8("version major")?;
    let version_minor = r.u8("version minor")?;
    let server_properties = field_table(&mut r)?;
    let mechanisms = long_string(&mut r, "mechanisms")?;
    let locales = long_string(&mut r, "locales")?;

    Ok(ConnectionStart {
        version_major,
        version_minor,
        server_properties,
        mechanisms: mechanisms.split_whitespace().map(String::from).collect(),
        locales: locales.split_whitespace().map(String::from).collect(),
    })
}

fn long_string(r: &mut ByteReader<'_>, field: &str) -> Result<String> {
    let len = r.u32_be(field)? as usize;
    r.text(len, field)
}

fn short_string(r: &mut ByteReader<'_>, field: &str) -> Result<String> {
    let len = r.u8(field)? as usize;
    r.text(len, field)
}

fn field_table(r: &mut ByteReader<'_>) -> Result<Map<String, Value>> {
    let len = r.u32_be("field table length")? as usize;
    let bytes = r.bytes(len, "field table")?;
    let mut t = ByteReader::new("AMQP", bytes);
    let mut table = Map::new();
    while !t.is_empty() {
        let name = short_string(&mut t, "field name")?;
        let value = field_value(&mut t)?;
        table.insert(name, value);
    }
    Ok(table)
}

fn field_value(r: &mut ByteReader<'_>) -> Result<Value> {
    let tag = r.u8("field type")?;
    let value = match tag {
        b't' => Value::Bool(r.u8("boolean")? != 0),
        b'b' => Value::from(r.u8("short-short int")? as i8),
        b'B' => Value::from(r.u8("short-short uint")?),
        b's' | b'U' => Value::from(r.i16_be("short int")?),
        b'u' => Value::from(r.u16_be("short uint")?),
        b'I' => Value::from(r.i32_be("long int")?),
        b'i' => Value::from(r.u32_be("long uint")?),
        b'l' | b'L' => Value::from(r.u64_be("long-long")?),
        b'f' => Value::from(f32::from_bits(r.u32_be("float")?) as f64),
        b'd' => Value::from(f64::from_bits(r.u64_be("double")?)),
        b'D' => {
            let scale = r.u8("decimal scale")?;
            let raw = r.u32_be("decimal value")?;
            Value::from(raw as f64 / 10f64.powi(scale as i32))
        }
        b'S' => Value::String(long_string(r, "long string")?),
        b'x' => {
            let len = r.u32_be("byte array length")? as usize;
            Value::String(hex::encode(r.bytes(len, "byte array")?))
        }
        b'A' => {
            let len = r.u32_be("array length")? as usize;
            let bytes = r.bytes(len, "array")?;
            let mut a = ByteReader::new("AMQP", bytes);
            let mut items = Vec::new();
            while !a.is_empty() {
                items.push(field_value(&mut a)?);
            }
            Value::Array(items)
        }
        b'T' => Value::from(r.u64_be("timestamp")?),
        b'F' => Value::Object(field_table(r)?),
        b'V' => Value::Null,
        other => return Err(r.error(format!("unknown field type {:?}", other as char))),
    };
    Ok(value)
}

pub struct RabbitProbe;

#[async_trait]
impl Probe for RabbitProbe {
    type Request = ProbeTarget;

    fn name(&self) -> &'static str {
        "AMQP"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ProbeTarget> {
        tls_target(raw, DEFAULT_PORT, DEFAULT_TLS_PORT, limits)
    }

    fn target<'a>(&self, request: &'a ProbeTarget) -> &'a ProbeTarget {
        request
    }

    async fn handshake(&self, target: &ProbeTarget, conn: &mut Connection) -> Result<Payload> {
        let start = match conn.exchange(PROTOCOL_HEADER, &AmqpDecoder).await? {
            Incoming::ProtocolHeader(header) => {
                return Err(Error::rejected(
                    "AMQP",
                    format!(
                        "broker does not speak AMQP 0-9-1, it offered {}-{}-{}-{}",
                        header[4], header[5], header[6], header[7]
                    ),
                ))
            }
            Incoming::Frame { kind, channel, payload } => {
                if kind != FRAME_METHOD || channel != 0 {
                    return Err(Error::protocol(
                        "AMQP",
                        format!("expected method frame on channel 0, got type {} on channel {}", kind, channel),
                    ));
                }
                decode_connection_start(&payload)?
            }
        };

        let props = &start.server_properties;
        let text = |key: &str| props.get(key).and_then(Value::as_str).map(String::from);

        let mut payload = Payload::new()
            .with("versionMajor", start.version_major)
            .with("versionMinor", start.version_minor)
            .with("tls", target.tls)
            .with("mechanisms", start.mechanisms.clone())
            .with("locales", start.locales.clone())
            .with("serverProperties", Value::Object(props.clone()));
        for (field, key) in [
            ("product", "product"),
            ("version", "version"),
            ("platform", "platform"),
            ("clusterName", "cluster_name"),
            ("copyright", "copyright"),
        ] {
            if let Some(value) = text(key) {
                payload.insert(field, value);
            }
        }
        if let Some(capabilities) = props.get("capabilities") {
            payload.insert("capabilities", capabilities.clone());
        }
        Ok(payload)
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub target: ProbeTarget,
    pub path: String,
    pub username: String,
    pub password: String,
}

pub struct RabbitApi;

#[async_trait]
impl Probe for RabbitApi {
    type Request = ApiRequest;

    fn name(&self) -> &'static str {
        "RabbitMQ"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ApiRequest> {
        static PATH: OnceLock<regex::Regex> = OnceLock::new();

        let path = raw
            .str_field("path")?
            .unwrap_or_else(|| String::from("/api/overview"));
        if !path.starts_with("/api/") {
            return Err(Error::validation("Path must start with /api/"));
        }
        validate_pattern(
            &path,
            pattern(&PATH, r"^/api/[A-Za-z0-9_.%/?=&,-]*$"),
            "Invalid path characters",
        )?;
        // %2e decodes to '.', so an encoded segment can still climb out of /api/
        if path.contains("..") || path.to_ascii_lowercase().contains("%2e") {
            return Err(Error::validation("Path must not contain '..'"));
        }

        Ok(ApiRequest {
            target: tls_target(raw, MANAGEMENT_PORT, MANAGEMENT_TLS_PORT, limits)?,
            path,
            username: raw.str_field("username")?.unwrap_or_else(|| String::from("guest")),
            password: raw.str_field("password")?.unwrap_or_else(|| String::from("guest")),
        })
    }

    fn target<'a>(&self, request: &'a ApiRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &ApiRequest, conn: &mut Connection) -> Result<Payload> {
        let credentials = BASE64_STANDARD.encode(format!("{}:{}", request.username, request.password));
        let http_request = HttpRequest::new("GET", request.path.clone(), request.target.address())
            .header("Authorization", format!("Basic {}", credentials))
            .header("Accept", "application/json")
            .header("User-Agent", "wireprobe");
        let response = http::exchange(conn, &http_request).await?;

        if !(200..300).contains(&response.status) {
            return Err(Error::rejected(
                "RabbitMQ",
                format!("management API returned {} {}", response.status, response.reason),
            ));
        }

        let body = match serde_json::from_slice::<Value>(&response.body) {
            Ok(json) => json,
            Err(_) => {
                let text = response.body_text();
                let mut end = text.len().min(MAX_BODY_PREVIEW);
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                Value::String(text[..end].to_string())
            }
        };
        Ok(Payload::new()
            .with("statusCode", response.status)
            .with("path", request.path.clone())
            .with("body", body))
    }
}
