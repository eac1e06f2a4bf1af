//! FIX session Logon (35=A)
//!
//! Messages are `tag=value` fields separated by SOH. BodyLength (9) counts
//! the bytes after its own field up to the checksum field, and CheckSum (10)
//! is the byte sum modulo 256, rendered as three digits.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::OnceLock;
use wireprobe_core::{validate_pattern, Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{find, Decoded, FrameDecoder};
use crate::protocols::pattern;
use crate::transport::Connection;

pub const SOH: u8 = 0x01;
pub const BEGIN_STRINGS: &[&str] = &["FIX.4.0", "FIX.4.1", "FIX.4.2", "FIX.4.3", "FIX.4.4", "FIXT.1.1"];

const MAX_MESSAGE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct FixRequest {
    pub target: ProbeTarget,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub begin_string: String,
    pub heartbeat_interval: u32,
}

/// A parsed message as ordered `(tag, value)` pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub fields: Vec<(u32, String)>,
}

impl Message {
    pub fn get(&self, tag: u32) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
    }
}

pub fn msg_type_name(msg_type: &str) -> &'static str {
    match msg_type {
        "0" => "Heartbeat",
        "1" => "TestRequest",
        "2" => "ResendRequest",
        "3" => "Reject",
        "4" => "SequenceReset",
        "5" => "Logout",
        "A" => "Logon",
        "j" => "BusinessMessageReject",
        _ => "Unknown",
    }
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Wrap body fields with BeginString, BodyLength and CheckSum
pub fn encode_message(begin_string: &str, body: &[(u32, String)]) -> Vec<u8> {
    let mut body_bytes = Vec::new();
    for (tag, value) in body {
        body_bytes.extend_from_slice(format!("{}={}", tag, value).as_bytes());
        body_bytes.push(SOH);
    }
    let mut out = format!("8={}\x019={}\x01", begin_string, body_bytes.len()).into_bytes();
    out.extend_from_slice(&body_bytes);
    let sum = checksum(&out);
    out.extend_from_slice(format!("10={:03}\x01", sum).as_bytes());
    out
}

pub fn encode_logon(request: &FixRequest, sending_time: &str) -> Vec<u8> {
    let mut body = vec![
        (35, String::from("A")),
        (49, request.sender_comp_id.clone()),
        (56, request.target_comp_id.clone()),
        (34, String::from("1")),
        (52, sending_time.to_string()),
        (98, String::from("0")),
        (108, request.heartbeat_interval.to_string()),
        (141, String::from("Y")),
    ];
    if request.begin_string == "FIXT.1.1" {
        // DefaultApplVerID = FIX50SP2
        body.push((1137, String::from("9")));
    }
    encode_message(&request.begin_string, &body)
}

/// Frames one message by reading through its declared BodyLength and trailer
pub struct MessageDecoder;

impl FrameDecoder for MessageDecoder {
    type Frame = Vec<u8>;

    fn decode(&self, buf: &[u8]) -> Decoded<Vec<u8>> {
        if buf.len() >= 2 && !buf.starts_with(b"8=") {
            return Decoded::invalid("message does not start with BeginString (8=)");
        }
        let begin_end = match find(buf, &[SOH]) {
            Some(pos) => pos,
            None if buf.len() > 64 => return Decoded::invalid("BeginString is not terminated"),
            None => return Decoded::Incomplete,
        };
        let rest = &buf[begin_end + 1..];
        if !b"9=".starts_with(&rest[..rest.len().min(2)]) {
            return Decoded::invalid("BodyLength (9) must be the second field");
        }
        let length_end = match find(rest, &[SOH]) {
            Some(pos) if pos >= 2 => pos,
            Some(_) => return Decoded::invalid("BodyLength (9) must be the second field"),
            None if rest.len() > 16 => return Decoded::invalid("BodyLength is not terminated"),
            None => return Decoded::Incomplete,
        };
        let body_len: usize = match std::str::from_utf8(&rest[2..length_end])
            .ok()
            .and_then(|s| s.parse().ok())
        {
            Some(n) if n <= MAX_MESSAGE => n,
            Some(n) => return Decoded::invalid(format!("declared BodyLength {} is too large", n)),
            None => return Decoded::invalid("BodyLength is not a number"),
        };
        // BeginString, BodyLength, body, then "10=nnn<SOH>"
        let total = begin_end + 1 + length_end + 1 + body_len + 7;
        if total > MAX_MESSAGE {
            return Decoded::invalid(format!("declared BodyLength {} is too large", body_len));
        }
        if buf.len() < total {
            return Decoded::Incomplete;
        }
        Decoded::complete(buf[..total].to_vec(), total)
    }

    fn stage(&self) -> &'static str {
        "awaiting FIX message"
    }
}

pub fn decode_message(frame: &[u8]) -> Result<Message> {
    let trailer_at = frame
        .len()
        .checked_sub(7)
        .filter(|at| frame[*at..].starts_with(b"10="))
        .ok_or_else(|| Error::protocol("FIX", "message has no CheckSum trailer"))?;
    let declared = std::str::from_utf8(&frame[trailer_at + 3..trailer_at + 6])
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::protocol("FIX", "CheckSum is not numeric"))?;
    let actual = checksum(&frame[..trailer_at]);
    if declared != actual as u16 {
        return Err(Error::protocol(
            "FIX",
            format!("CheckSum mismatch: declared {:03}, computed {:03}", declared, actual),
        ));
    }

    let mut fields = Vec::new();
    for field in frame[..trailer_at].split(|b| *b == SOH).filter(|f| !f.is_empty()) {
        let text = String::from_utf8_lossy(field);
        let (tag, value) = text
            .split_once('=')
            .ok_or_else(|| Error::protocol("FIX", format!("field without '=': {}", text)))?;
        let tag = tag
            .parse::<u32>()
            .map_err(|_| Error::protocol("FIX", format!("non-numeric tag: {}", tag)))?;
        fields.push((tag, value.to_string()));
    }
    Ok(Message { fields })
}

pub struct FixLogon;

#[async_trait]
impl Probe for FixLogon {
    type Request = FixRequest;

    fn name(&self) -> &'static str {
        "FIX"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<FixRequest> {
        static COMP_ID: OnceLock<regex::Regex> = OnceLock::new();

        let target = raw.target(None, None, limits)?;
        let comp_id = pattern(&COMP_ID, r"^[A-Za-z0-9_.-]{1,64}$");
        let sender_comp_id = raw
            .str_field("senderCompId")?
            .ok_or_else(|| Error::validation("Missing required parameter: senderCompId"))?;
        let target_comp_id = raw
            .str_field("targetCompId")?
            .ok_or_else(|| Error::validation("Missing required parameter: targetCompId"))?;
        validate_pattern(&sender_comp_id, comp_id, "Invalid senderCompId format")?;
        validate_pattern(&target_comp_id, comp_id, "Invalid targetCompId format")?;

        let begin_string = raw.str_field("beginString")?.unwrap_or_else(|| String::from("FIX.4.4"));
        if !BEGIN_STRINGS.contains(&begin_string.as_str()) {
            return Err(Error::validation(format!(
                "Invalid beginString. Must be one of: {}",
                BEGIN_STRINGS.join(", ")
            )));
        }
        let heartbeat_interval = raw.ranged_field("heartBtInt", 1, 3600)?.unwrap_or(30) as u32;

        Ok(FixRequest {
            target,
            sender_comp_id,
            target_comp_id,
            begin_string,
            heartbeat_interval,
        })
    }

    fn target<'a>(&self, request: &'a FixRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &FixRequest, conn: &mut Connection) -> Result<Payload> {
        let sending_time = Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string();
        let frame = conn
            .exchange(&encode_logon(request, &sending_time), &MessageDecoder)
            .await?;
        let reply = decode_message(&frame)?;

        let msg_type = reply.get(35).unwrap_or_default().to_string();
        let fields: serde_json::Map<String, serde_json::Value> = reply
            .fields
            .iter()
            .map(|(tag, value)| (tag.to_string(), serde_json::Value::from(value.clone())))
            .collect();

        let mut payload = Payload::new()
            .with("msgTypeName", msg_type_name(&msg_type))
            .with("logonAccepted", msg_type == "A")
            .with("beginString", reply.get(8).unwrap_or_default())
            .with("senderCompId", reply.get(49).unwrap_or_default())
            .with("targetCompId", reply.get(56).unwrap_or_default())
            .with("msgType", msg_type)
            .with("fields", fields);
        if let Some(text) = reply.get(58) {
            payload.insert("text", text);
        }
        if let Some(interval) = reply.get(108) {
            payload.insert("heartBtInt", interval);
        }
        Ok(payload)
    }
}
