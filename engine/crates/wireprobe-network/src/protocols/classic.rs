//! Classic inetd services: echo (RFC 862), discard (RFC 863), daytime
//! (RFC 867), chargen (RFC 864), time (RFC 868) and finger (RFC 1288)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::OnceLock;
use std::time::Duration;
use wireprobe_core::{validate_pattern, Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::protocols::{pattern, plain_target};
use crate::transport::Connection;

pub const ECHO_PORT: u16 = 7;
pub const DISCARD_PORT: u16 = 9;
pub const DAYTIME_PORT: u16 = 13;
pub const CHARGEN_PORT: u16 = 19;
pub const TIME_PORT: u16 = 37;
pub const FINGER_PORT: u16 = 79;

/// Seconds between 1900-01-01 and the Unix epoch
pub const EPOCH_OFFSET: i64 = 2_208_988_800;

const MAX_PAYLOAD: usize = 1024;
const MAX_TEXT: usize = 64 * 1024;
const DEFAULT_CHARGEN_BYTES: i64 = 512;
const DISCARD_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct PayloadRequest {
    pub target: ProbeTarget,
    pub payload: String,
}

fn payload_request(raw: &RawRequest, port: u16, limits: &ProbeLimits) -> Result<PayloadRequest> {
    let target = plain_target(raw, port, limits)?;
    let payload = raw.str_field("payload")?.unwrap_or_else(|| String::from("wireprobe"));
    if payload.is_empty() || payload.len() > MAX_PAYLOAD {
        return Err(Error::validation(format!(
            "payload must be between 1 and {} bytes",
            MAX_PAYLOAD
        )));
    }
    Ok(PayloadRequest { target, payload })
}

pub struct EchoTest;

#[async_trait]
impl Probe for EchoTest {
    type Request = PayloadRequest;

    fn name(&self) -> &'static str {
        "Echo"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<PayloadRequest> {
        payload_request(raw, ECHO_PORT, limits)
    }

    fn target<'a>(&self, request: &'a PayloadRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &PayloadRequest, conn: &mut Connection) -> Result<Payload> {
        let sent = request.payload.as_bytes();
        conn.send(sent).await?;
        let echoed = conn.read_exact(sent.len()).await?;
        Ok(Payload::new()
            .with("echoed", String::from_utf8_lossy(&echoed).into_owned())
            .with("matched", echoed == sent)
            .with("bytes", echoed.len()))
    }
}

pub struct DiscardTest;

#[async_trait]
impl Probe for DiscardTest {
    type Request = PayloadRequest;

    fn name(&self) -> &'static str {
        "Discard"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<PayloadRequest> {
        payload_request(raw, DISCARD_PORT, limits)
    }

    fn target<'a>(&self, request: &'a PayloadRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &PayloadRequest, conn: &mut Connection) -> Result<Payload> {
        conn.send(request.payload.as_bytes()).await?;
        // A discard server stays silent; anything sent back is noted
        let unexpected = conn.read_available(MAX_PAYLOAD, DISCARD_SETTLE).await?;
        let mut payload = Payload::new()
            .with("bytesSent", request.payload.len())
            .with("accepted", true);
        if !unexpected.is_empty() {
            payload.insert("unexpectedBytes", unexpected.len());
        }
        Ok(payload)
    }
}

pub struct DaytimeQuery;

#[async_trait]
impl Probe for DaytimeQuery {
    type Request = ProbeTarget;

    fn name(&self) -> &'static str {
        "Daytime"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ProbeTarget> {
        plain_target(raw, DAYTIME_PORT, limits)
    }

    fn target<'a>(&self, request: &'a ProbeTarget) -> &'a ProbeTarget {
        request
    }

    async fn handshake(&self, _target: &ProbeTarget, conn: &mut Connection) -> Result<Payload> {
        let reply = conn.read_to_end(MAX_PAYLOAD).await?;
        Ok(Payload::new().with("daytime", String::from_utf8_lossy(&reply).trim().to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ChargenRequest {
    pub target: ProbeTarget,
    pub bytes: usize,
}

/// Whether complete lines follow the rotating printable-ASCII pattern
///
/// Accepts both the 95-character alphabet starting at space and the
/// 94-character alphabet starting at `!`.
pub fn chargen_pattern_valid(sample: &[u8]) -> bool {
    let complete = match sample.iter().rposition(|b| *b == b'\n') {
        Some(end) => &sample[..end],
        None => return false,
    };
    let lines: Vec<&[u8]> = complete
        .split(|b| *b == b'\n')
        .filter_map(|l| l.strip_suffix(b"\r"))
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return false;
    }
    let (low, span) = if lines.iter().any(|l| l.contains(&b' ')) {
        (b' ', 95u8)
    } else {
        (b'!', 94u8)
    };
    let successor = |c: u8| low + (c - low + 1) % span;
    let in_range = |c: &u8| *c >= low && *c < low + span;

    let width = lines[0].len();
    lines.iter().all(|l| l.len() == width && l.iter().all(in_range))
        && lines
            .iter()
            .all(|l| l.windows(2).all(|w| w[1] == successor(w[0])))
        && lines
            .windows(2)
            .all(|pair| pair[1][0] == successor(pair[0][0]))
}

pub struct ChargenSample;

#[async_trait]
impl Probe for ChargenSample {
    type Request = ChargenRequest;

    fn name(&self) -> &'static str {
        "Chargen"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ChargenRequest> {
        let target = plain_target(raw, CHARGEN_PORT, limits)?;
        let bytes = raw
            .ranged_field("bytes", 1, 65536)?
            .unwrap_or(DEFAULT_CHARGEN_BYTES) as usize;
        Ok(ChargenRequest { target, bytes })
    }

    fn target<'a>(&self, request: &'a ChargenRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &ChargenRequest, conn: &mut Connection) -> Result<Payload> {
        let sample = conn.read_exact(request.bytes).await?;
        let text = String::from_utf8_lossy(&sample);
        let lines = sample.iter().filter(|b| **b == b'\n').count();
        let preview: String = text.lines().take(3).collect::<Vec<_>>().join("\n");
        Ok(Payload::new()
            .with("bytesReceived", sample.len())
            .with("lines", lines)
            .with("sample", preview)
            .with("patternValid", chargen_pattern_valid(&sample)))
    }
}

/// RFC 868 seconds since 1900 converted to Unix time
pub fn unix_from_rfc868(raw: u32) -> i64 {
    raw as i64 - EPOCH_OFFSET
}

pub struct TimeQuery;

#[async_trait]
impl Probe for TimeQuery {
    type Request = ProbeTarget;

    fn name(&self) -> &'static str {
        "Time"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ProbeTarget> {
        plain_target(raw, TIME_PORT, limits)
    }

    fn target<'a>(&self, request: &'a ProbeTarget) -> &'a ProbeTarget {
        request
    }

    async fn handshake(&self, _target: &ProbeTarget, conn: &mut Connection) -> Result<Payload> {
        let b = conn.read_exact(4).await?;
        let raw_seconds = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        let unix_time = unix_from_rfc868(raw_seconds);
        let remote = DateTime::<Utc>::from_timestamp(unix_time, 0)
            .ok_or_else(|| Error::protocol("Time", format!("timestamp {} out of range", raw_seconds)))?;

        Ok(Payload::new()
            .with("rawSeconds", raw_seconds)
            .with("unixTime", unix_time)
            .with("iso8601", remote.to_rfc3339())
            .with("offsetSeconds", unix_time - Utc::now().timestamp()))
    }
}

#[derive(Debug, Clone)]
pub struct FingerRequest {
    pub target: ProbeTarget,
    pub username: String,
}

pub struct FingerQuery;

#[async_trait]
impl Probe for FingerQuery {
    type Request = FingerRequest;

    fn name(&self) -> &'static str {
        "Finger"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<FingerRequest> {
        static USER: OnceLock<regex::Regex> = OnceLock::new();

        let target = plain_target(raw, FINGER_PORT, limits)?;
        let username = raw.str_field("username")?.unwrap_or_default();
        validate_pattern(&username, pattern(&USER, r"^[A-Za-z0-9_.-]{0,32}$"), "Invalid username format")?;
        Ok(FingerRequest { target, username })
    }

    fn target<'a>(&self, request: &'a FingerRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &FingerRequest, conn: &mut Connection) -> Result<Payload> {
        conn.send(format!("{}\r\n", request.username).as_bytes()).await?;
        let reply = conn.read_to_end(MAX_TEXT).await?;
        Ok(Payload::new()
            .with("query", request.username.clone())
            .with("response", String::from_utf8_lossy(&reply).trim_end().to_string()))
    }
}
