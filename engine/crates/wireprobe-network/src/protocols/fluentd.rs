//! Fluentd forward protocol, message mode with acknowledgement
//!
//! The probe sends one `[tag, time, record, {"chunk": id}]` entry encoded
//! as MessagePack and waits for the `{"ack": id}` reply.

use async_trait::async_trait;
use base64::prelude::*;
use rand::RngCore;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use wireprobe_core::{validate_pattern, Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{Decoded, FrameDecoder};
use crate::protocols::pattern;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 24224;

const MAX_RECORD_BYTES: usize = 8 * 1024;
const MAX_ACK_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct FluentdRequest {
    pub target: ProbeTarget,
    pub tag: String,
    pub record: Map<String, Value>,
}

/// One forward-mode message: `[tag, time, record, {"chunk": chunk}]`
pub fn encode_message(tag: &str, time: u64, record: &Map<String, Value>, chunk: &str) -> Result<Vec<u8>> {
    let options = BTreeMap::from([("chunk", chunk)]);
    rmp_serde::to_vec(&(tag, time, record, options))
        .map_err(|e| Error::Internal(format!("encoding forward message: {}", e)))
}

fn is_truncated(error: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error as DecodeError;

    match error {
        DecodeError::InvalidMarkerRead(e) | DecodeError::InvalidDataRead(e) => {
            e.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Frames the forwarder's ack reply
///
/// The ack is the last thing the forwarder sends on the connection, so a
/// complete value consumes the whole buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckDecoder;

impl FrameDecoder for AckDecoder {
    type Frame = Value;

    fn decode(&self, buf: &[u8]) -> Decoded<Value> {
        if buf.len() > MAX_ACK_BYTES {
            return Decoded::invalid(format!("ack response exceeds {} bytes", MAX_ACK_BYTES));
        }
        match rmp_serde::from_slice::<Value>(buf) {
            Ok(value) => Decoded::complete(value, buf.len()),
            Err(e) if is_truncated(&e) => Decoded::Incomplete,
            Err(e) => Decoded::invalid(format!("malformed MessagePack ack: {}", e)),
        }
    }

    fn stage(&self) -> &'static str {
        "awaiting ack"
    }
}

pub fn new_chunk_id() -> String {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    BASE64_STANDARD.encode(id)
}

pub struct FluentdSend;

#[async_trait]
impl Probe for FluentdSend {
    type Request = FluentdRequest;

    fn name(&self) -> &'static str {
        "Fluentd"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<FluentdRequest> {
        static TAG: OnceLock<regex::Regex> = OnceLock::new();

        let target = raw.target(Some(DEFAULT_PORT), None, limits)?;
        let tag = raw
            .str_field("tag")?
            .unwrap_or_else(|| String::from("wireprobe.probe"));
        validate_pattern(&tag, pattern(&TAG, r"^[A-Za-z0-9_.\-]{1,128}$"), "Invalid tag format")?;

        let record = match raw.object_field("record")? {
            Some(record) => record,
            None => {
                let mut record = Map::new();
                record.insert(String::from("message"), Value::from("wireprobe connectivity probe"));
                record.insert(String::from("source"), Value::from("wireprobe"));
                record
            }
        };
        let encoded = rmp_serde::to_vec(&record)
            .map_err(|e| Error::validation(format!("record cannot be encoded: {}", e)))?;
        if encoded.len() > MAX_RECORD_BYTES {
            return Err(Error::validation(format!(
                "record exceeds {} bytes when encoded",
                MAX_RECORD_BYTES
            )));
        }

        Ok(FluentdRequest {
            target,
            tag,
            record,
        })
    }

    fn target<'a>(&self, request: &'a FluentdRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &FluentdRequest, conn: &mut Connection) -> Result<Payload> {
        let chunk = new_chunk_id();
        let time = chrono::Utc::now().timestamp().max(0) as u64;
        let message = encode_message(&request.tag, time, &request.record, &chunk)?;

        let reply = conn.exchange(&message, &AckDecoder).await?;
        let ack = reply.get("ack").and_then(Value::as_str).ok_or_else(|| {
            Error::protocol("Fluentd", format!("expected an ack map, got {}", reply))
        })?;
        if ack != chunk {
            return Err(Error::protocol(
                "Fluentd",
                format!("ack {:?} does not match chunk {:?}", ack, chunk),
            ));
        }

        Ok(Payload::new()
            .with("ackReceived", true)
            .with("chunk", chunk)
            .with("tag", request.tag.clone())
            .with("bytesSent", message.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_message_layout() {
        let record: Map<String, Value> = serde_json::from_str(r#"{"k":"v"}"#).unwrap();
        let bytes = encode_message("app.logs", 1_700_000_000, &record, "abc").unwrap();
        assert_eq!(bytes[0], 0x94);
        assert_eq!(bytes[1], 0xa8);
        assert_eq!(&bytes[2..10], b"app.logs");
        assert_eq!(bytes[10], 0xce);

        let value: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value[0], "app.logs");
        assert_eq!(value[1], 1_700_000_000u64);
        assert_eq!(value[2]["k"], "v");
        assert_eq!(value[3]["chunk"], "abc");
    }

    #[test]
    fn test_partial_ack_is_incomplete() {
        let ack = rmp_serde::to_vec(&serde_json::json!({"ack": "chunk-id"})).unwrap();
        assert_eq!(AckDecoder.decode(&ack[..ack.len() - 2]), Decoded::Incomplete);
        assert_eq!(AckDecoder.decode(&[]), Decoded::Incomplete);
        match AckDecoder.decode(&ack) {
            Decoded::Complete { frame, consumed } => {
                assert_eq!(frame["ack"], "chunk-id");
                assert_eq!(consumed, ack.len());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(AckDecoder.decode(&[0xc1]), Decoded::Invalid(_)));
    }

    #[test]
    fn test_ack_with_huge_declared_length() {
        // str32 claiming 4 GiB with a handful of bytes behind it
        let ack = [0x81, 0xa3, b'a', b'c', b'k', 0xdb, 0xff, 0xff, 0xff, 0xff, b'x'];
        assert!(!matches!(AckDecoder.decode(&ack), Decoded::Complete { .. }));
        assert!(matches!(
            AckDecoder.decode(&vec![0xc0; MAX_ACK_BYTES + 1]),
            Decoded::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn test_tag_validation_happens_before_io() {
        let raw = RawRequest::new()
            .with("host", "127.0.0.1")
            .with("port", 9)
            .with("tag", "invalid tag with spaces!");
        let started = Instant::now();
        let envelope = run(&FluentdSend, raw).await;
        assert!(!envelope.success);
        assert_eq!(envelope.status, 400);
        assert!(envelope.error.unwrap().contains("Invalid tag format"));
        assert!(started.elapsed() < Duration::from_millis(50));

        let ok = RawRequest::new().with("host", "127.0.0.1").with("tag", "app.logs.access");
        assert!(FluentdSend.validate(&ok, &ProbeLimits::default()).is_ok());
    }

    #[tokio::test]
    async fn test_ack_against_fake_forwarder() {
        let port = serve_once(|mut socket| async move {
            let mut buf = vec![0u8; 4096];
            let mut len = 0;
            let message = loop {
                let n = socket.read(&mut buf[len..]).await.unwrap();
                len += n;
                if let Ok(value) = rmp_serde::from_slice::<Value>(&buf[..len]) {
                    break value;
                }
            };
            let chunk = message[3]["chunk"].clone();
            let ack = rmp_serde::to_vec(&serde_json::json!({ "ack": chunk })).unwrap();
            socket.write_all(&ack).await.unwrap();
        })
        .await;

        let envelope = run(&FluentdSend, local(port).with("tag", "app.logs.access")).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["ackReceived"], true);
        assert_eq!(json["tag"], "app.logs.access");
    }
}
