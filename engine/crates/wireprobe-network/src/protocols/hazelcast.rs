//! Hazelcast open binary client protocol 2.x: ClientAuthentication
//!
//! A client message is a sequence of frames, each `len:i32le flags:u16le
//! content`, where the length includes the 6-byte frame header. The first
//! frame carries the message type, correlation id and fixed-size fields;
//! strings and nested structures follow as frames of their own. The last
//! frame of a message carries `IS_FINAL`.

use async_trait::async_trait;
use uuid::Uuid;
use wireprobe_core::{Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{ByteReader, Decoded, FrameDecoder, MAX_FRAME_LEN};
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 5701;

pub const PROTOCOL_HEADER: &[u8; 3] = b"CP2";

const AUTH_REQUEST: i32 = 0x000100;
const AUTH_RESPONSE: i32 = 0x000101;
const ERROR_RESPONSE: i32 = 0x000000;

const FRAME_HEADER: usize = 6;
const UNFRAGMENTED: u16 = 0xC000;
const IS_FINAL: u16 = 1 << 13;
const BEGIN_DATA_STRUCTURE: u16 = 1 << 12;
const END_DATA_STRUCTURE: u16 = 1 << 11;
const IS_NULL: u16 = 1 << 10;

const SERIALIZATION_VERSION: u8 = 1;

#[derive(Debug, Clone)]
pub struct HazelcastRequest {
    pub target: ProbeTarget,
    pub cluster_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub flags: u16,
    pub content: Vec<u8>,
}

impl Frame {
    fn new(flags: u16, content: Vec<u8>) -> Self {
        Self { flags, content }
    }

    fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Decoded ClientAuthentication response
#[derive(Debug, Clone, PartialEq)]
pub struct AuthResponse {
    pub status: u8,
    pub member_uuid: Option<Uuid>,
    pub serialization_version: u8,
    pub partition_count: i32,
    pub cluster_id: Option<Uuid>,
    pub failover_supported: Option<bool>,
    pub address: Option<(String, i32)>,
    pub server_version: Option<String>,
}

pub fn status_name(status: u8) -> &'static str {
    match status {
        0 => "AUTHENTICATED",
        1 => "CREDENTIALS_FAILED",
        2 => "SERIALIZATION_VERSION_MISMATCH",
        3 => "NOT_ALLOWED_IN_CLUSTER",
        _ => "UNKNOWN",
    }
}

fn put_uuid(out: &mut Vec<u8>, uuid: Option<Uuid>) {
    match uuid {
        Some(uuid) => {
            let (msb, lsb) = uuid.as_u64_pair();
            out.push(0);
            out.extend_from_slice(&msb.to_le_bytes());
            out.extend_from_slice(&lsb.to_le_bytes());
        }
        None => {
            out.push(1);
            out.extend_from_slice(&[0u8; 16]);
        }
    }
}

fn string_frame(value: &str) -> Frame {
    Frame::new(0, value.as_bytes().to_vec())
}

fn nullable_string_frame(value: Option<&str>) -> Frame {
    match value {
        Some(value) => string_frame(value),
        None => Frame::new(IS_NULL, Vec::new()),
    }
}

pub fn encode_frames(frames: &[Frame]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend_from_slice(&((FRAME_HEADER + frame.content.len()) as i32).to_le_bytes());
        out.extend_from_slice(&frame.flags.to_le_bytes());
        out.extend_from_slice(&frame.content);
    }
    out
}

/// Protocol header followed by a ClientAuthentication request
pub fn encode_authentication(request: &HazelcastRequest, correlation_id: i64, client_uuid: Uuid) -> Vec<u8> {
    let mut initial = Vec::with_capacity(38);
    initial.extend_from_slice(&AUTH_REQUEST.to_le_bytes());
    initial.extend_from_slice(&correlation_id.to_le_bytes());
    initial.extend_from_slice(&(-1i32).to_le_bytes());
    put_uuid(&mut initial, Some(client_uuid));
    initial.push(SERIALIZATION_VERSION);

    let frames = [
        Frame::new(UNFRAGMENTED, initial),
        string_frame(&request.cluster_name),
        nullable_string_frame(request.username.as_deref()),
        nullable_string_frame(request.password.as_deref()),
        string_frame("RST"),
        string_frame("5.3.0"),
        string_frame("wireprobe"),
        // labels: empty list
        Frame::new(BEGIN_DATA_STRUCTURE, Vec::new()),
        Frame::new(END_DATA_STRUCTURE | IS_FINAL, Vec::new()),
    ];

    let mut out = PROTOCOL_HEADER.to_vec();
    out.extend(encode_frames(&frames));
    out
}

/// Frames one complete client message (through the frame flagged `IS_FINAL`)
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageDecoder;

impl FrameDecoder for MessageDecoder {
    type Frame = Vec<Frame>;

    fn decode(&self, buf: &[u8]) -> Decoded<Vec<Frame>> {
        let mut frames = Vec::new();
        let mut at = 0;
        loop {
            if buf.len() < at + FRAME_HEADER {
                return Decoded::Incomplete;
            }
            let len = i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
            if len < FRAME_HEADER as i32 || len as usize > MAX_FRAME_LEN {
                return Decoded::invalid(format!("invalid frame length {}", len));
            }
            let len = len as usize;
            if at + len > MAX_FRAME_LEN {
                return Decoded::invalid("message exceeds the frame limit");
            }
            if buf.len() < at + len {
                return Decoded::Incomplete;
            }
            let flags = u16::from_le_bytes([buf[at + 4], buf[at + 5]]);
            frames.push(Frame::new(flags, buf[at + FRAME_HEADER..at + len].to_vec()));
            at += len;
            if flags & IS_FINAL != 0 {
                return Decoded::complete(frames, at);
            }
        }
    }

    fn stage(&self) -> &'static str {
        "awaiting authentication response"
    }
}

fn read_uuid(r: &mut ByteReader<'_>, field: &str) -> Result<Option<Uuid>> {
    let is_null = r.u8(field)? != 0;
    let msb = r.u64_le(field)?;
    let lsb = r.u64_le(field)?;
    Ok((!is_null).then(|| Uuid::from_u64_pair(msb, lsb)))
}

pub fn decode_authentication(frames: &[Frame], correlation_id: i64) -> Result<AuthResponse> {
    let Some(initial) = frames.first() else {
        return Err(Error::protocol("Hazelcast", "empty client message"));
    };
    let mut r = ByteReader::new("Hazelcast", &initial.content);
    let message_type = r.i32_le("message type")?;
    let got = r.i64_le("correlation id")?;
    if got != correlation_id {
        return Err(r.error(format!("correlation id mismatch: sent {}, got {}", correlation_id, got)));
    }
    if message_type == ERROR_RESPONSE {
        let detail = frames
            .iter()
            .skip(1)
            .find(|f| !f.content.is_empty() && f.content.iter().all(|b| b.is_ascii_graphic() || *b == b' '))
            .map(|f| String::from_utf8_lossy(&f.content).into_owned())
            .unwrap_or_else(|| String::from("no details"));
        return Err(Error::rejected("Hazelcast", format!("server returned an error: {}", detail)));
    }
    if message_type != AUTH_RESPONSE {
        return Err(r.error(format!("unexpected message type {:#08x}", message_type)));
    }
    r.skip(1, "backup acks")?;

    let status = r.u8("status")?;
    let member_uuid = read_uuid(&mut r, "member uuid")?;
    let serialization_version = r.u8("serialization version")?;
    let partition_count = r.i32_le("partition count")?;
    let cluster_id = read_uuid(&mut r, "cluster id")?;
    let failover_supported = if r.is_empty() {
        None
    } else {
        Some(r.u8("failover supported")? != 0)
    };

    // Variable-size fields: nullable Address, then the server version string
    let mut rest = frames[1..].iter();
    let mut address = None;
    match rest.next() {
        Some(frame) if frame.has(IS_NULL) => {}
        Some(frame) if frame.has(BEGIN_DATA_STRUCTURE) => {
            let mut port = None;
            let mut host = None;
            for inner in rest.by_ref() {
                if inner.has(END_DATA_STRUCTURE) {
                    break;
                }
                if port.is_none() && inner.content.len() >= 4 {
                    let c = &inner.content;
                    port = Some(i32::from_le_bytes([c[0], c[1], c[2], c[3]]));
                } else if host.is_none() {
                    host = Some(String::from_utf8_lossy(&inner.content).into_owned());
                }
            }
            if let (Some(host), Some(port)) = (host, port) {
                address = Some((host, port));
            }
        }
        _ => {}
    }
    let server_version = rest
        .next()
        .filter(|f| !f.has(IS_NULL))
        .map(|f| String::from_utf8_lossy(&f.content).into_owned());

    Ok(AuthResponse {
        status,
        member_uuid,
        serialization_version,
        partition_count,
        cluster_id,
        failover_supported,
        address,
        server_version,
    })
}

pub struct HazelcastProbe;

#[async_trait]
impl Probe for HazelcastProbe {
    type Request = HazelcastRequest;

    fn name(&self) -> &'static str {
        "Hazelcast"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<HazelcastRequest> {
        let target = raw.target(Some(DEFAULT_PORT), None, limits)?;
        let cluster_name = raw
            .str_field("clusterName")?
            .unwrap_or_else(|| String::from("dev"));
        if cluster_name.len() > 256 || cluster_name.chars().any(char::is_control) {
            return Err(Error::validation("Invalid clusterName"));
        }
        Ok(HazelcastRequest {
            target,
            cluster_name,
            username: raw.str_field("username")?,
            password: raw.str_field("password")?,
        })
    }

    fn target<'a>(&self, request: &'a HazelcastRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &HazelcastRequest, conn: &mut Connection) -> Result<Payload> {
        let correlation_id = rand::random::<u32>() as i64;
        let message = encode_authentication(request, correlation_id, Uuid::new_v4());
        let frames = conn.exchange(&message, &MessageDecoder).await?;
        let response = decode_authentication(&frames, correlation_id)?;

        let mut payload = Payload::new()
            .with("status", response.status)
            .with("statusName", status_name(response.status))
            .with("authenticated", response.status == 0)
            .with("clusterName", request.cluster_name.clone())
            .with("serializationVersion", response.serialization_version)
            .with("partitionCount", response.partition_count);
        if let Some(version) = response.server_version {
            payload.insert("serverVersion", version);
        }
        if let Some(uuid) = response.member_uuid {
            payload.insert("memberUuid", uuid.to_string());
        }
        if let Some(uuid) = response.cluster_id {
            payload.insert("clusterId", uuid.to_string());
        }
        if let Some(failover) = response.failover_supported {
            payload.insert("failoverSupported", failover);
        }
        if let Some((host, port)) = response.address {
            payload.insert("memberAddress", format!("{}:{}", host, port));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn auth_response(correlation_id: i64, status: u8) -> Vec<u8> {
        let member = Uuid::from_u64_pair(1, 2);
        let mut initial = AUTH_RESPONSE.to_le_bytes().to_vec();
        initial.extend_from_slice(&correlation_id.to_le_bytes());
        initial.push(0);
        initial.push(status);
        put_uuid(&mut initial, Some(member));
        initial.push(1);
        initial.extend_from_slice(&271i32.to_le_bytes());
        put_uuid(&mut initial, Some(Uuid::from_u64_pair(3, 4)));
        initial.push(0);

        encode_frames(&[
            Frame::new(UNFRAGMENTED, initial),
            Frame::new(BEGIN_DATA_STRUCTURE, Vec::new()),
            Frame::new(0, 5701i32.to_le_bytes().to_vec()),
            Frame::new(0, b"10.0.0.7".to_vec()),
            Frame::new(END_DATA_STRUCTURE, Vec::new()),
            Frame::new(IS_FINAL, b"5.3.6".to_vec()),
        ])
    }

    #[test]
    fn test_request_layout() {
        let request = HazelcastRequest {
            target: ProbeTarget::new("10.0.0.1", 5701, std::time::Duration::from_secs(1)),
            cluster_name: String::from("dev"),
            username: None,
            password: None,
        };
        let bytes = encode_authentication(&request, 9, Uuid::nil());
        assert_eq!(&bytes[..3], b"CP2");
        let frames = match MessageDecoder.decode(&bytes[3..]) {
            Decoded::Complete { frame, consumed } => {
                assert_eq!(consumed, bytes.len() - 3);
                frame
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(frames.len(), 9);
        assert_eq!(&frames[0].content[..4], &AUTH_REQUEST.to_le_bytes());
        assert_eq!(frames[1].content, b"dev");
        assert!(frames[2].has(IS_NULL));
        assert!(frames[8].has(IS_FINAL));
    }

    #[test]
    fn test_decode_response() {
        let bytes = auth_response(77, 0);
        let Decoded::Complete { frame, .. } = MessageDecoder.decode(&bytes) else {
            panic!("incomplete");
        };
        let response = decode_authentication(&frame, 77).unwrap();
        assert_eq!(response.status, 0);
        assert_eq!(response.partition_count, 271);
        assert_eq!(response.server_version.as_deref(), Some("5.3.6"));
        assert_eq!(response.address, Some((String::from("10.0.0.7"), 5701)));
        assert_eq!(response.member_uuid, Some(Uuid::from_u64_pair(1, 2)));
        assert!(decode_authentication(&frame, 78).is_err());
    }

    #[test]
    fn test_frame_length_bounds() {
        let mut bytes = vec![0u8; 6];
        bytes[0] = 3;
        assert!(matches!(MessageDecoder.decode(&bytes), Decoded::Invalid(_)));
        assert_eq!(MessageDecoder.decode(&auth_response(1, 0)[..20]), Decoded::Incomplete);
    }

    #[tokio::test]
    async fn test_probe_against_fake_member() {
        let port = serve_once(|mut socket| async move {
            let mut header = [0u8; 3];
            socket.read_exact(&mut header).await.unwrap();
            let mut len = [0u8; 4];
            socket.read_exact(&mut len).await.unwrap();
            let mut rest = vec![0u8; i32::from_le_bytes(len) as usize - 4];
            socket.read_exact(&mut rest).await.unwrap();
            let correlation_id = i64::from_le_bytes(rest[6..14].try_into().unwrap());
            socket.write_all(&auth_response(correlation_id, 1)).await.unwrap();
        })
        .await;

        let envelope = run(&HazelcastProbe, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["statusName"], "CREDENTIALS_FAILED");
        assert_eq!(json["authenticated"], false);
        assert_eq!(json["serverVersion"], "5.3.6");
    }
}
