//! BGP-4 OPEN exchange (RFC 4271)
//!
//! Idle -> Connecting -> SentOpen -> AwaitingPeerOpen -> Established | Failed.
//! The probe sends an OPEN advertising IPv4 unicast and 4-octet AS support,
//! waits for the peer's OPEN, then confirms it with a KEEPALIVE.

use async_trait::async_trait;
use serde::Serialize;
use std::net::Ipv4Addr;
use tracing::debug;
use wireprobe_core::{Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{ByteReader, LengthPrefixed};
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 179;

const HEADER_LEN: usize = 19;
const MAX_MESSAGE_LEN: usize = 4096;
const AS_TRANS: u16 = 23456;

const MSG_OPEN: u8 = 1;
const MSG_UPDATE: u8 = 2;
const MSG_NOTIFICATION: u8 = 3;
const MSG_KEEPALIVE: u8 = 4;

#[derive(Debug, Clone)]
pub struct BgpRequest {
    pub target: ProbeTarget,
    pub local_as: u16,
    pub router_id: Ipv4Addr,
    pub hold_time: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerOpen {
    pub version: u8,
    #[serde(rename = "peerAS")]
    pub peer_as: u32,
    pub hold_time: u16,
    pub router_id: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BgpResult {
    session_established: bool,
    state: &'static str,
    #[serde(rename = "localAS")]
    local_as: u16,
    peer_open: PeerOpen,
}

/// A decoded BGP message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Open(PeerOpen),
    Notification { code: u8, subcode: u8 },
    Keepalive,
    Other(u8),
}

/// Encode an OPEN with the multiprotocol (IPv4 unicast) and 4-octet AS capabilities
pub fn encode_open(local_as: u16, hold_time: u16, router_id: Ipv4Addr) -> Vec<u8> {
    let capabilities: [u8; 16] = {
        let as4 = (local_as as u32).to_be_bytes();
        [
            2, 6, 1, 4, 0, 1, 0, 1, // MP-BGP: AFI 1, SAFI 1
            2, 6, 65, 4, as4[0], as4[1], as4[2], as4[3],
        ]
    };

    let mut body = vec![4];
    body.extend_from_slice(&local_as.to_be_bytes());
    body.extend_from_slice(&hold_time.to_be_bytes());
    body.extend_from_slice(&router_id.octets());
    body.push(capabilities.len() as u8);
    body.extend_from_slice(&capabilities);

    encode_message(MSG_OPEN, &body)
}

pub fn encode_keepalive() -> Vec<u8> {
    encode_message(MSG_KEEPALIVE, &[])
}

fn encode_message(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![0xFF; 16];
    out.extend_from_slice(&((HEADER_LEN + body.len()) as u16).to_be_bytes());
    out.push(kind);
    out.extend_from_slice(body);
    out
}

/// Frames one message; rejects a bad marker or an out-of-range length
pub fn message_decoder() -> LengthPrefixed<impl Fn(&[u8]) -> std::result::Result<usize, String>> {
    LengthPrefixed::new(HEADER_LEN, |header: &[u8]| {
        if header[..16].iter().any(|b| *b != 0xFF) {
            return Err(String::from("invalid BGP marker"));
        }
        Ok(u16::from_be_bytes([header[16], header[17]]) as usize)
    })
    .max_len(MAX_MESSAGE_LEN)
}

/// Parse a complete framed message
pub fn decode_message(frame: &[u8]) -> Result<Message> {
    let mut r = ByteReader::new("BGP", frame);
    r.skip(18, "header")?;
    let kind = r.u8("message type")?;

    match kind {
        MSG_OPEN => decode_open(&mut r).map(Message::Open),
        MSG_NOTIFICATION => Ok(Message::Notification {
            code: r.u8("error code")?,
            subcode: r.u8("error subcode")?,
        }),
        MSG_KEEPALIVE => Ok(Message::Keepalive),
        other => Ok(Message::Other(other)),
    }
}

fn decode_open(r: &mut ByteReader<'_>) -> Result<PeerOpen> {
    let version = r.u8("version")?;
    let two_octet_as = r.u16_be("AS")?;
    let hold_time = r.u16_be("hold time")?;
    let router_id = Ipv4Addr::from(r.array::<4>("router id")?);
    let params_len = r.u8("optional parameters length")? as usize;
    let params = r.bytes(params_len, "optional parameters")?;

    let mut capabilities = Vec::new();
    let mut four_octet_as = None;
    let mut p = ByteReader::new("BGP", params);
    while !p.is_empty() {
        let param_type = p.u8("parameter type")?;
        let len = p.u8("parameter length")? as usize;
        let value = p.bytes(len, "parameter value")?;
        if param_type != 2 {
            continue;
        }
        let mut c = ByteReader::new("BGP", value);
        while !c.is_empty() {
            let code = c.u8("capability code")?;
            let len = c.u8("capability length")? as usize;
            let data = c.bytes(len, "capability value")?;
            if code == 65 && data.len() == 4 {
                four_octet_as = Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
            }
            capabilities.push(capability_name(code, data));
        }
    }

    let peer_as = match four_octet_as {
        Some(as4) if two_octet_as == AS_TRANS => as4,
        _ => two_octet_as as u32,
    };

    Ok(PeerOpen {
        version,
        peer_as,
        hold_time,
        router_id: router_id.to_string(),
        capabilities,
    })
}

fn capability_name(code: u8, data: &[u8]) -> String {
    match code {
        1 if data.len() == 4 => {
            let afi = u16::from_be_bytes([data[0], data[1]]);
            format!("multiprotocol(afi={},safi={})", afi, data[3])
        }
        2 => String::from("route-refresh"),
        6 => String::from("extended-message"),
        64 => String::from("graceful-restart"),
        65 => String::from("four-octet-as"),
        69 => String::from("add-path"),
        70 => String::from("enhanced-route-refresh"),
        71 => String::from("long-lived-graceful-restart"),
        73 => String::from("fqdn"),
        128 => String::from("route-refresh-cisco"),
        other => format!("capability-{}", other),
    }
}

pub fn notification_name(code: u8) -> &'static str {
    match code {
        1 => "Message Header Error",
        2 => "OPEN Message Error",
        3 => "UPDATE Message Error",
        4 => "Hold Timer Expired",
        5 => "Finite State Machine Error",
        6 => "Cease",
        7 => "ROUTE-REFRESH Message Error",
        _ => "Unknown",
    }
}

pub struct BgpConnect;

#[async_trait]
impl Probe for BgpConnect {
    type Request = BgpRequest;

    fn name(&self) -> &'static str {
        "BGP"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<BgpRequest> {
        let target = raw.target(Some(DEFAULT_PORT), None, limits)?;
        let local_as = raw
            .ranged_field("localAS", 1, 65535)
            .map_err(|_| Error::validation("localAS must be between 1 and 65535"))?
            .unwrap_or(64512) as u16;
        let router_id = match raw.str_field("routerId")? {
            Some(id) => id
                .parse::<Ipv4Addr>()
                .map_err(|_| Error::validation("Invalid router ID format (expected dotted quad)"))?,
            None => Ipv4Addr::new(10, 0, 0, 1),
        };
        let hold_time = match raw.i64_field("holdTime")? {
            None => 90,
            Some(0) => 0,
            Some(t) if (3..=65535).contains(&t) => t as u16,
            Some(_) => return Err(Error::validation("holdTime must be 0 or between 3 and 65535")),
        };

        Ok(BgpRequest {
            target,
            local_as,
            router_id,
            hold_time,
        })
    }

    fn target<'a>(&self, request: &'a BgpRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &BgpRequest, conn: &mut Connection) -> Result<Payload> {
        let open = encode_open(request.local_as, request.hold_time, request.router_id);
        let frame = conn.exchange(&open, &message_decoder()).await?;

        let peer_open = match decode_message(&frame)? {
            Message::Open(open) => open,
            Message::Notification { code, subcode } => {
                return Err(Error::protocol(
                    "BGP",
                    format!(
                        "peer sent NOTIFICATION: {} (code {}, subcode {})",
                        notification_name(code),
                        code,
                        subcode
                    ),
                ))
            }
            Message::Keepalive => {
                return Err(Error::protocol("BGP", "expected OPEN, peer sent KEEPALIVE"))
            }
            Message::Other(kind) => {
                let name = if kind == MSG_UPDATE { "UPDATE" } else { "unknown" };
                return Err(Error::protocol(
                    "BGP",
                    format!("expected OPEN, peer sent {} message (type {})", name, kind),
                ));
            }
        };
        if peer_open.version != 4 {
            return Err(Error::protocol(
                "BGP",
                format!("unsupported BGP version {}", peer_open.version),
            ));
        }
        debug!("Peer OPEN from AS{}", peer_open.peer_as);

        // The peer may close right after its OPEN; the session was still established
        if let Err(e) = conn.send(&encode_keepalive()).await {
            debug!("KEEPALIVE not delivered: {}", e);
        }

        Payload::from_serialize(&BgpResult {
            session_established: true,
            state: "Established",
            local_as: request.local_as,
            peer_open,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{Decoded, FrameDecoder};
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use wireprobe_core::ErrorKind;

    fn peer_open() -> Vec<u8> {
        let mut body = vec![4];
        body.extend_from_slice(&65001u16.to_be_bytes());
        body.extend_from_slice(&180u16.to_be_bytes());
        body.extend_from_slice(&[10, 0, 0, 5]);
        body.push(0);
        encode_message(MSG_OPEN, &body)
    }

    #[test]
    fn test_encode_open_layout() {
        let open = encode_open(64512, 90, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(&open[..16], &[0xFF; 16]);
        assert_eq!(u16::from_be_bytes([open[16], open[17]]) as usize, open.len());
        assert_eq!(open[18], MSG_OPEN);
        assert_eq!(open[19], 4);
        assert_eq!(&open[20..22], &64512u16.to_be_bytes());
        assert_eq!(&open[22..24], &90u16.to_be_bytes());
        assert_eq!(&open[24..28], &[10, 0, 0, 1]);
        assert_eq!(open[28] as usize, open.len() - 29);
    }

    #[test]
    fn test_decode_peer_open() {
        let frame = peer_open();
        match decode_message(&frame).unwrap() {
            Message::Open(open) => {
                assert_eq!(open.version, 4);
                assert_eq!(open.peer_as, 65001);
                assert_eq!(open.hold_time, 180);
                assert_eq!(open.router_id, "10.0.0.5");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_four_octet_as_replaces_as_trans() {
        let mut body = vec![4];
        body.extend_from_slice(&AS_TRANS.to_be_bytes());
        body.extend_from_slice(&90u16.to_be_bytes());
        body.extend_from_slice(&[192, 0, 2, 1]);
        body.extend_from_slice(&[8, 2, 6, 65, 4]);
        body.extend_from_slice(&4_200_000_000u32.to_be_bytes());
        match decode_message(&encode_message(MSG_OPEN, &body)).unwrap() {
            Message::Open(open) => {
                assert_eq!(open.peer_as, 4_200_000_000);
                assert_eq!(open.capabilities, vec!["four-octet-as"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decoder_rejects_bad_marker_and_length() {
        let mut bad_marker = peer_open();
        bad_marker[3] = 0;
        assert!(matches!(message_decoder().decode(&bad_marker), Decoded::Invalid(_)));

        let mut short = peer_open();
        short[16] = 0;
        short[17] = 10;
        assert!(matches!(message_decoder().decode(&short), Decoded::Invalid(_)));

        let frame = peer_open();
        assert_eq!(message_decoder().decode(&frame[..20]), Decoded::Incomplete);
    }

    #[test]
    fn test_validation() {
        let limits = ProbeLimits::default();
        let base = RawRequest::new().with("host", "192.0.2.1");

        let request = BgpConnect.validate(&base, &limits).unwrap();
        assert_eq!(request.target.port, 179);
        assert_eq!(request.local_as, 64512);
        assert_eq!(request.hold_time, 90);

        assert!(BgpConnect.validate(&base.clone().with("localAS", 0), &limits).is_err());
        assert!(BgpConnect.validate(&base.clone().with("localAS", 70000), &limits).is_err());
        assert!(BgpConnect.validate(&base.clone().with("holdTime", 2), &limits).is_err());
        assert!(BgpConnect.validate(&base.clone().with("routerId", "10.0.0"), &limits).is_err());
    }

    #[tokio::test]
    async fn test_session_established_against_fake_peer() {
        let port = serve_once(|mut socket| async move {
            let mut open = vec![0u8; 45];
            socket.read_exact(&mut open).await.unwrap();
            socket.write_all(&peer_open()).await.unwrap();
            let mut keepalive = [0u8; 19];
            let _ = socket.read_exact(&mut keepalive).await;
        })
        .await;

        let envelope = run(&BgpConnect, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["sessionEstablished"], true);
        assert_eq!(json["peerOpen"]["version"], 4);
        assert_eq!(json["peerOpen"]["peerAS"], 65001);
        assert_eq!(json["peerOpen"]["holdTime"], 180);
        assert_eq!(json["peerOpen"]["routerId"], "10.0.0.5");
    }

    #[tokio::test]
    async fn test_notification_is_protocol_error() {
        let port = serve_once(|mut socket| async move {
            let mut open = vec![0u8; 45];
            socket.read_exact(&mut open).await.unwrap();
            socket
                .write_all(&encode_message(MSG_NOTIFICATION, &[2, 2]))
                .await
                .unwrap();
        })
        .await;

        let envelope = run(&BgpConnect, local(port)).await;
        assert!(!envelope.success);
        assert_eq!(envelope.error_code, Some("PROTOCOL_ERROR"));
        assert!(envelope.error.unwrap().contains("OPEN Message Error"));
        assert_eq!(envelope.status, ErrorKind::Protocol.status());
    }
}
