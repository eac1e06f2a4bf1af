//! PPTP control connection start (RFC 2637 section 2.1/2.2)
//!
//! Sends a Start-Control-Connection-Request and decodes the Reply; a
//! Stop-Control-Connection-Request is sent afterwards so the server can
//! release the control connection.

use async_trait::async_trait;
use tracing::debug;
use wireprobe_core::{Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{c_string, ByteReader, LengthPrefixed};
use crate::protocols::plain_target;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 1723;

pub const MAGIC_COOKIE: u32 = 0x1A2B_3C4D;
const SCCRQ_LEN: u16 = 156;
const CONTROL_MESSAGE: u16 = 1;
const SCCRQ: u16 = 1;
const SCCRP: u16 = 2;
const STOP_CCRQ: u16 = 3;

/// Decoded Start-Control-Connection-Reply
#[derive(Debug, Clone, PartialEq)]
pub struct StartReply {
    pub protocol_version: u16,
    pub result_code: u8,
    pub error_code: u8,
    pub framing_capabilities: u32,
    pub bearer_capabilities: u32,
    pub max_channels: u16,
    pub firmware_revision: u16,
    pub hostname: String,
    pub vendor: String,
}

pub fn result_name(code: u8) -> &'static str {
    match code {
        1 => "Successful channel establishment",
        2 => "General error",
        3 => "Command channel already exists",
        4 => "Requester is not authorized",
        5 => "Protocol version not supported",
        _ => "Unknown",
    }
}

fn header(out: &mut Vec<u8>, len: u16, control_type: u16) {
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&CONTROL_MESSAGE.to_be_bytes());
    out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    out.extend_from_slice(&control_type.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
}

fn padded(out: &mut Vec<u8>, text: &str, width: usize) {
    let bytes = text.as_bytes();
    let n = bytes.len().min(width);
    out.extend_from_slice(&bytes[..n]);
    out.extend(std::iter::repeat(0).take(width - n));
}

pub fn encode_start_request() -> Vec<u8> {
    let mut out = Vec::with_capacity(SCCRQ_LEN as usize);
    header(&mut out, SCCRQ_LEN, SCCRQ);
    out.extend_from_slice(&0x0100u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&3u32.to_be_bytes());
    out.extend_from_slice(&3u32.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    padded(&mut out, "wireprobe", 64);
    padded(&mut out, "wireprobe", 64);
    out
}

pub fn encode_stop_request() -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    header(&mut out, 16, STOP_CCRQ);
    out.extend_from_slice(&[1, 0, 0, 0]);
    out
}

pub fn message_decoder() -> LengthPrefixed<impl Fn(&[u8]) -> std::result::Result<usize, String>> {
    LengthPrefixed::new(2, |header: &[u8]| Ok(u16::from_be_bytes([header[0], header[1]]) as usize))
        .max_len(4096)
}

pub fn decode_start_reply(frame: &[u8]) -> Result<StartReply> {
    let mut r = ByteReader::new("PPTP", frame);
    r.skip(2, "length")?;
    let message_type = r.u16_be("message type")?;
    let cookie = r.u32_be("magic cookie")?;
    if cookie != MAGIC_COOKIE {
        return Err(r.error(format!("bad magic cookie {:#010x}", cookie)));
    }
    if message_type != CONTROL_MESSAGE {
        return Err(r.error(format!("expected control message, got type {}", message_type)));
    }
    let control_type = r.u16_be("control message type")?;
    if control_type != SCCRP {
        return Err(r.error(format!(
            "expected Start-Control-Connection-Reply, got control type {}",
            control_type
        )));
    }
    r.skip(2, "reserved")?;

    Ok(StartReply {
        protocol_version: r.u16_be("protocol version")?,
        result_code: r.u8("result code")?,
        error_code: r.u8("error code")?,
        framing_capabilities: r.u32_be("framing capabilities")?,
        bearer_capabilities: r.u32_be("bearer capabilities")?,
        max_channels: r.u16_be("maximum channels")?,
        firmware_revision: r.u16_be("firmware revision")?,
        hostname: c_string(r.bytes(64, "host name")?),
        vendor: c_string(r.bytes(64, "vendor string")?),
    })
}

fn capability_names(bits: u32, names: [&'static str; 2]) -> Vec<&'static str> {
    names
        .iter()
        .enumerate()
        .filter(|(i, _)| bits & (1 << i) != 0)
        .map(|(_, name)| *name)
        .collect()
}

pub struct PptpConnect;

#[async_trait]
impl Probe for PptpConnect {
    type Request = ProbeTarget;

    fn name(&self) -> &'static str {
        "PPTP"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ProbeTarget> {
        plain_target(raw, DEFAULT_PORT, limits)
    }

    fn target<'a>(&self, request: &'a ProbeTarget) -> &'a ProbeTarget {
        request
    }

    async fn handshake(&self, _target: &ProbeTarget, conn: &mut Connection) -> Result<Payload> {
        let frame = conn.exchange(&encode_start_request(), &message_decoder()).await?;
        let reply = decode_start_reply(&frame)?;

        if let Err(e) = conn.send(&encode_stop_request()).await {
            debug!("Stop-Control-Connection-Request not delivered: {}", e);
        }

        Ok(Payload::new()
            .with(
                "protocolVersion",
                format!("{}.{}", reply.protocol_version >> 8, reply.protocol_version & 0xff),
            )
            .with("resultCode", reply.result_code)
            .with("resultName", result_name(reply.result_code))
            .with("generalErrorCode", reply.error_code)
            .with("hostname", reply.hostname)
            .with("vendor", reply.vendor)
            .with("firmwareRevision", reply.firmware_revision)
            .with("maxChannels", reply.max_channels)
            .with("framingCapabilities", capability_names(reply.framing_capabilities, ["async", "sync"]))
            .with("bearerCapabilities", capability_names(reply.bearer_capabilities, ["analog", "digital"])))
    }
}
