//! ZeroMQ Message Transport Protocol (ZMTP 3.x) greeting and NULL handshake
//!
//! Greeting layout: 10-byte signature (0xFF, 8 padding bytes, 0x7F),
//! version major/minor, 20-byte NUL-padded mechanism, as-server flag,
//! 31 filler bytes. Peers may send the greeting in pieces, so each part
//! is read separately.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use wireprobe_core::{Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{c_string, ByteReader, Decoded, FrameDecoder, MAX_FRAME_LEN};
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 5555;

pub const SIGNATURE: [u8; 10] = [0xFF, 0, 0, 0, 0, 0, 0, 0, 0, 0x7F];

pub const SOCKET_TYPES: &[&str] = &[
    "REQ", "REP", "DEALER", "ROUTER", "PUB", "SUB", "XPUB", "XSUB", "PUSH", "PULL", "PAIR",
];

const FLAG_MORE: u8 = 0x01;
const FLAG_LONG: u8 = 0x02;
const FLAG_COMMAND: u8 = 0x04;

#[derive(Debug, Clone)]
pub struct ZmtpRequest {
    pub target: ProbeTarget,
    pub socket_type: String,
}

/// What the peer's greeting announced
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Greeting {
    #[serde(rename = "isZMTP")]
    pub is_zmtp: bool,
    pub version: String,
    pub major: u8,
    pub minor: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_server: Option<bool>,
}

/// One ZMTP frame (message part or command)
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub flags: u8,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn is_command(&self) -> bool {
        self.flags & FLAG_COMMAND != 0
    }
}

/// A parsed command frame
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub properties: BTreeMap<String, Vec<u8>>,
    pub data: Vec<u8>,
}

/// Our full 64-byte greeting
pub fn encode_greeting(as_server: bool) -> Vec<u8> {
    let mut out = SIGNATURE.to_vec();
    out.extend_from_slice(&[3, 0]);
    let mut mechanism = [0u8; 20];
    mechanism[..4].copy_from_slice(b"NULL");
    out.extend_from_slice(&mechanism);
    out.push(as_server as u8);
    out.extend_from_slice(&[0u8; 31]);
    out
}

pub fn encode_command(name: &str, properties: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = vec![name.len() as u8];
    body.extend_from_slice(name.as_bytes());
    for (key, value) in properties {
        body.push(key.len() as u8);
        body.extend_from_slice(key.as_bytes());
        body.extend_from_slice(&(value.len() as u32).to_be_bytes());
        body.extend_from_slice(value);
    }

    let mut out = Vec::with_capacity(body.len() + 9);
    if body.len() <= 255 {
        out.push(FLAG_COMMAND);
        out.push(body.len() as u8);
    } else {
        out.push(FLAG_COMMAND | FLAG_LONG);
        out.extend_from_slice(&(body.len() as u64).to_be_bytes());
    }
    out.extend_from_slice(&body);
    out
}

pub fn encode_ready(socket_type: &str) -> Vec<u8> {
    encode_command("READY", &[("Socket-Type", socket_type.as_bytes())])
}

pub fn check_signature(signature: &[u8]) -> bool {
    signature == SIGNATURE
}

/// Decode the version and mechanism parts of a greeting
///
/// `rest` holds whatever followed the version bytes; for ZMTP 3 it must
/// contain at least the 20-byte mechanism.
pub fn decode_greeting(signature: &[u8], version: [u8; 2], rest: &[u8]) -> Result<Greeting> {
    if !check_signature(signature) {
        return Err(Error::protocol(
            "ZMTP",
            format!("invalid greeting signature {}", hex::encode(signature)),
        ));
    }
    let [major, minor] = version;
    let (mechanism, as_server) = if major >= 3 {
        if rest.len() < 20 {
            return Err(Error::protocol("ZMTP", "greeting truncated before mechanism"));
        }
        (Some(c_string(&rest[..20])), rest.get(20).map(|b| *b == 1))
    } else {
        (None, None)
    };

    Ok(Greeting {
        is_zmtp: true,
        version: format!("{}.{}", major, minor),
        major,
        minor,
        mechanism,
        as_server,
    })
}

/// Frames ZMTP 3 frames: flags, 1- or 8-byte size, body
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameDecoderZmtp;

impl FrameDecoder for FrameDecoderZmtp {
    type Frame = Frame;

    fn decode(&self, buf: &[u8]) -> Decoded<Frame> {
        let Some(&flags) = buf.first() else {
            return Decoded::Incomplete;
        };
        if flags & !(FLAG_MORE | FLAG_LONG | FLAG_COMMAND) != 0 {
            return Decoded::invalid(format!("reserved frame flag bits set: {:#04x}", flags));
        }
        let (header, size) = if flags & FLAG_LONG != 0 {
            if buf.len() < 9 {
                return Decoded::Incomplete;
            }
            let mut size = [0u8; 8];
            size.copy_from_slice(&buf[1..9]);
            (9, u64::from_be_bytes(size))
        } else {
            if buf.len() < 2 {
                return Decoded::Incomplete;
            }
            (2, buf[1] as u64)
        };
        if size > MAX_FRAME_LEN as u64 {
            return Decoded::invalid(format!("frame size {} exceeds limit", size));
        }
        let total = header + size as usize;
        if buf.len() < total {
            return Decoded::Incomplete;
        }
        Decoded::complete(
            Frame {
                flags,
                body: buf[header..total].to_vec(),
            },
            total,
        )
    }

    fn stage(&self) -> &'static str {
        "awaiting ZMTP frame"
    }
}

pub fn decode_command(frame: &Frame) -> Result<Command> {
    if !frame.is_command() {
        return Err(Error::protocol("ZMTP", "expected a command frame"));
    }
    let mut r = ByteReader::new("ZMTP", &frame.body);
    let name_len = r.u8("command name length")? as usize;
    let name = r.text(name_len, "command name")?;

    let mut properties = BTreeMap::new();
    let mut data = Vec::new();
    match name.as_str() {
        "READY" => {
            while !r.is_empty() {
                let key_len = r.u8("property name length")? as usize;
                let key = r.text(key_len, "property name")?;
                let value_len = r.u32_be("property value length")? as usize;
                let value = r.bytes(value_len, "property value")?;
                properties.insert(key, value.to_vec());
            }
        }
        _ => data = r.rest().to_vec(),
    }
    Ok(Command {
        name,
        properties,
        data,
    })
}

fn validate_request(raw: &RawRequest, limits: &ProbeLimits) -> Result<ZmtpRequest> {
    let target = raw.target(Some(DEFAULT_PORT), None, limits)?;
    let socket_type = raw
        .str_field("socketType")?
        .map(|s| s.to_ascii_uppercase())
        .unwrap_or_else(|| String::from("DEALER"));
    if !SOCKET_TYPES.contains(&socket_type.as_str()) {
        return Err(Error::validation(format!(
            "Invalid socketType. Must be one of: {}",
            SOCKET_TYPES.join(", ")
        )));
    }
    Ok(ZmtpRequest {
        target,
        socket_type,
    })
}

/// Exchange greetings; returns the decoded peer greeting
///
/// With `full_tail` the as-server flag and filler must arrive in full, so the
/// next read starts on a frame boundary.
async fn exchange_greeting(conn: &mut Connection, full_tail: bool) -> Result<Greeting> {
    conn.send(&encode_greeting(false)).await?;
    let signature = conn.read_exact(SIGNATURE.len()).await?;
    if !check_signature(&signature) {
        return decode_greeting(&signature, [0, 0], &[]);
    }
    let version = conn.read_exact(2).await?;
    let version = [version[0], version[1]];
    let rest = if version[0] >= 3 {
        let mut rest = conn.read_exact(20).await?;
        if full_tail {
            rest.extend(conn.read_exact(32).await?);
        } else {
            // as-server + filler; absent from some minimal peers
            rest.extend(conn.read_available(32, Duration::from_millis(100)).await?);
        }
        rest
    } else {
        Vec::new()
    };
    decode_greeting(&signature, version, &rest)
}

pub struct ZmtpProbe;

#[async_trait]
impl Probe for ZmtpProbe {
    type Request = ZmtpRequest;

    fn name(&self) -> &'static str {
        "ZMTP"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ZmtpRequest> {
        validate_request(raw, limits)
    }

    fn target<'a>(&self, request: &'a ZmtpRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, _request: &ZmtpRequest, conn: &mut Connection) -> Result<Payload> {
        let greeting = exchange_greeting(conn, false).await?;
        Payload::from_serialize(&greeting)
    }
}

pub struct ZmtpHandshake;

#[async_trait]
impl Probe for ZmtpHandshake {
    type Request = ZmtpRequest;

    fn name(&self) -> &'static str {
        "ZMTP"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ZmtpRequest> {
        validate_request(raw, limits)
    }

    fn target<'a>(&self, request: &'a ZmtpRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &ZmtpRequest, conn: &mut Connection) -> Result<Payload> {
        let greeting = exchange_greeting(conn, true).await?;
        if greeting.major < 3 {
            return Err(Error::protocol(
                "ZMTP",
                format!("peer speaks ZMTP {}, READY handshake needs 3.x", greeting.version),
            ));
        }
        match greeting.mechanism.as_deref() {
            Some("NULL") => {}
            Some(other) => {
                return Err(Error::rejected(
                    "ZMTP",
                    format!("peer requires the {} security mechanism", other),
                ))
            }
            None => return Err(Error::protocol("ZMTP", "greeting carried no mechanism")),
        }

        let frame = conn
            .exchange(&encode_ready(&request.socket_type), &FrameDecoderZmtp)
            .await?;
        let command = decode_command(&frame)?;
        debug!("ZMTP peer answered with {}", command.name);

        match command.name.as_str() {
            "READY" => {}
            "ERROR" => {
                let reason = command.data.get(1..).map(String::from_utf8_lossy).unwrap_or_default();
                return Err(Error::rejected("ZMTP", format!("peer sent ERROR: {}", reason)));
            }
            other => {
                return Err(Error::protocol(
                    "ZMTP",
                    format!("expected READY, peer sent {}", other),
                ))
            }
        }

        let property = |key: &str| {
            command
                .properties
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
        };
        let mut payload = Payload::from_serialize(&greeting)?
            .with("socketType", request.socket_type.clone())
            .with("handshakeComplete", true);
        if let Some(peer_type) = property("Socket-Type") {
            payload.insert("peerSocketType", peer_type);
        }
        if let Some(identity) = property("Identity") {
            payload.insert("peerIdentity", identity);
        }
        Ok(payload)
    }
}
