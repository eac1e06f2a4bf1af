//! OpenFlow HELLO and FEATURES exchange
//!
//! The switch side of a controller connection: both ends send HELLO, the
//! lower version wins, then FEATURES_REQUEST asks the switch for its datapath
//! id and table counts. ECHO_REQUESTs arriving meanwhile are answered.

use async_trait::async_trait;
use rand::Rng;
use wireprobe_core::{Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{ByteReader, LengthPrefixed};
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 6653;

const HEADER_LEN: usize = 8;
const OFPT_HELLO: u8 = 0;
const OFPT_ERROR: u8 = 1;
const OFPT_ECHO_REQUEST: u8 = 2;
const OFPT_ECHO_REPLY: u8 = 3;
const OFPT_FEATURES_REQUEST: u8 = 5;
const OFPT_FEATURES_REPLY: u8 = 6;
const MAX_INTERLEAVED: usize = 16;

/// Wire version byte for each supported protocol release
pub const VERSIONS: &[(&str, u8)] = &[("1.0", 0x01), ("1.3", 0x04), ("1.4", 0x05), ("1.5", 0x06)];

#[derive(Debug, Clone)]
pub struct OpenFlowRequest {
    pub target: ProbeTarget,
    pub version: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kind: u8,
    pub length: u16,
    pub xid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Features {
    pub datapath_id: u64,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub capabilities: u32,
}

pub fn version_name(version: u8) -> &'static str {
    match version {
        0x01 => "1.0",
        0x02 => "1.1",
        0x03 => "1.2",
        0x04 => "1.3",
        0x05 => "1.4",
        0x06 => "1.5",
        _ => "unknown",
    }
}

pub fn capability_names(version: u8, bits: u32) -> Vec<&'static str> {
    let table: &[(u32, &str)] = if version == 0x01 {
        &[
            (0, "FLOW_STATS"),
            (1, "TABLE_STATS"),
            (2, "PORT_STATS"),
            (3, "STP"),
            (5, "IP_REASM"),
            (6, "QUEUE_STATS"),
            (7, "ARP_MATCH_IP"),
        ]
    } else {
        &[
            (0, "FLOW_STATS"),
            (1, "TABLE_STATS"),
            (2, "PORT_STATS"),
            (3, "GROUP_STATS"),
            (5, "IP_REASM"),
            (6, "QUEUE_STATS"),
            (8, "PORT_BLOCKED"),
        ]
    };
    table
        .iter()
        .filter(|(bit, _)| bits & (1 << bit) != 0)
        .map(|(_, name)| *name)
        .collect()
}

pub fn encode_header(version: u8, kind: u8, xid: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(version);
    out.push(kind);
    out.extend_from_slice(&((HEADER_LEN + body.len()) as u16).to_be_bytes());
    out.extend_from_slice(&xid.to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn message_decoder() -> LengthPrefixed<impl Fn(&[u8]) -> std::result::Result<usize, String>> {
    LengthPrefixed::new(HEADER_LEN, |header: &[u8]| {
        if header[0] == 0 || header[0] > 0x7f {
            return Err(format!("invalid OpenFlow version byte {:#04x}", header[0]));
        }
        Ok(u16::from_be_bytes([header[2], header[3]]) as usize)
    })
}

pub fn decode_header(frame: &[u8]) -> Result<(Header, &[u8])> {
    let mut r = ByteReader::new("OpenFlow", frame);
    let header = Header {
        version: r.u8("version")?,
        kind: r.u8("type")?,
        length: r.u16_be("length")?,
        xid: r.u32_be("xid")?,
    };
    Ok((header, r.rest()))
}

pub fn decode_features(body: &[u8]) -> Result<Features> {
    let mut r = ByteReader::new("OpenFlow", body);
    let datapath_id = r.u64_be("datapath id")?;
    let n_buffers = r.u32_be("n_buffers")?;
    let n_tables = r.u8("n_tables")?;
    r.skip(3, "padding")?;
    Ok(Features {
        datapath_id,
        n_buffers,
        n_tables,
        capabilities: r.u32_be("capabilities")?,
    })
}

fn decode_error(body: &[u8]) -> Error {
    let mut r = ByteReader::new("OpenFlow", body);
    match (r.u16_be("error type"), r.u16_be("error code")) {
        (Ok(kind), Ok(code)) => Error::rejected(
            "OpenFlow",
            format!("switch sent OFPT_ERROR type {} code {}", kind, code),
        ),
        _ => Error::protocol("OpenFlow", "truncated OFPT_ERROR"),
    }
}

pub fn format_datapath_id(id: u64) -> String {
    id.to_be_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

pub struct OpenFlowHello;

#[async_trait]
impl Probe for OpenFlowHello {
    type Request = OpenFlowRequest;

    fn name(&self) -> &'static str {
        "OpenFlow"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<OpenFlowRequest> {
        let target = raw.target(Some(DEFAULT_PORT), None, limits)?;
        let requested = raw.str_field("version")?.unwrap_or_else(|| String::from("1.3"));
        let version = VERSIONS
            .iter()
            .find(|(name, _)| *name == requested)
            .map(|(_, wire)| *wire)
            .ok_or_else(|| Error::validation("Invalid version. Must be one of: 1.0, 1.3, 1.4, 1.5"))?;
        Ok(OpenFlowRequest { target, version })
    }

    fn target<'a>(&self, request: &'a OpenFlowRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &OpenFlowRequest, conn: &mut Connection) -> Result<Payload> {
        let decoder = message_decoder();
        let xid: u32 = rand::thread_rng().gen();

        let frame = conn
            .exchange(&encode_header(request.version, OFPT_HELLO, xid, &[]), &decoder)
            .await?;
        let (hello, body) = decode_header(&frame)?;
        match hello.kind {
            OFPT_HELLO => {}
            OFPT_ERROR => return Err(decode_error(body)),
            other => {
                return Err(Error::protocol(
                    "OpenFlow",
                    format!("expected HELLO, got message type {}", other),
                ))
            }
        }
        let negotiated = hello.version.min(request.version);

        let features_xid = xid.wrapping_add(1);
        conn.send(&encode_header(negotiated, OFPT_FEATURES_REQUEST, features_xid, &[]))
            .await?;

        let mut features = None;
        for _ in 0..MAX_INTERLEAVED {
            let frame = conn.read_frame(&decoder).await?;
            let (header, body) = decode_header(&frame)?;
            match header.kind {
                OFPT_FEATURES_REPLY => {
                    features = Some(decode_features(body)?);
                    break;
                }
                OFPT_ECHO_REQUEST => {
                    conn.send(&encode_header(header.version, OFPT_ECHO_REPLY, header.xid, body))
                        .await?;
                }
                OFPT_ERROR => return Err(decode_error(body)),
                _ => {}
            }
        }
        let features = features
            .ok_or_else(|| Error::protocol("OpenFlow", "no FEATURES_REPLY among the switch's messages"))?;

        Ok(Payload::new()
            .with("peerVersion", version_name(hello.version))
            .with("negotiatedVersion", version_name(negotiated))
            .with("datapathId", format_datapath_id(features.datapath_id))
            .with("nBuffers", features.n_buffers)
            .with("nTables", features.n_tables)
            .with("capabilities", capability_names(negotiated, features.capabilities)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn features_reply(version: u8, xid: u32) -> Vec<u8> {
        let mut body = 0x0000_0000_0000_00abu64.to_be_bytes().to_vec();
        body.extend_from_slice(&256u32.to_be_bytes());
        body.extend_from_slice(&[254, 0, 0, 0]);
        body.extend_from_slice(&0b0100_0111u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        encode_header(version, OFPT_FEATURES_REPLY, xid, &body)
    }

    #[test]
    fn test_decoder_rejects_bad_lengths() {
        use crate::framing::{Decoded, FrameDecoder};
        let decoder = message_decoder();
        assert!(matches!(decoder.decode(&[4, 0, 0, 4, 0, 0, 0, 1]), Decoded::Invalid(_)));
        assert!(matches!(decoder.decode(&[0, 0, 0, 8, 0, 0, 0, 1]), Decoded::Invalid(_)));
        assert!(matches!(decoder.decode(&[4, 0, 0, 8, 0, 0, 0, 1]), Decoded::Complete { .. }));
    }

    #[test]
    fn test_capabilities_per_version() {
        assert_eq!(capability_names(0x01, 0b1000_1000), vec!["STP", "ARP_MATCH_IP"]);
        assert_eq!(capability_names(0x04, 0b1000), vec!["GROUP_STATS"]);
        assert_eq!(format_datapath_id(0xab), "00:00:00:00:00:00:00:ab");
    }

    #[test]
    fn test_version_validation() {
        let raw = RawRequest::new().with("host", "10.0.0.1").with("version", "1.1");
        assert!(OpenFlowHello.validate(&raw, &ProbeLimits::default()).is_err());
        let raw = RawRequest::new().with("host", "10.0.0.1").with("version", "1.0");
        assert_eq!(OpenFlowHello.validate(&raw, &ProbeLimits::default()).unwrap().version, 0x01);
    }

    #[tokio::test]
    async fn test_hello_against_fake_switch() {
        let port = serve_once(|mut socket| async move {
            let mut hello = [0u8; 8];
            socket.read_exact(&mut hello).await.unwrap();
            assert_eq!(hello[0], 0x04);
            socket.write_all(&encode_header(0x01, OFPT_HELLO, 1, &[])).await.unwrap();

            let mut request = [0u8; 8];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(request[0], 0x01);
            assert_eq!(request[1], OFPT_FEATURES_REQUEST);

            socket.write_all(&encode_header(0x01, OFPT_ECHO_REQUEST, 77, b"ping")).await.unwrap();
            let mut echo = [0u8; 12];
            socket.read_exact(&mut echo).await.unwrap();
            assert_eq!(echo[1], OFPT_ECHO_REPLY);

            let xid = u32::from_be_bytes([request[4], request[5], request[6], request[7]]);
            socket.write_all(&features_reply(0x01, xid)).await.unwrap();
        })
        .await;

        let envelope = run(&OpenFlowHello, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["peerVersion"], "1.0");
        assert_eq!(json["negotiatedVersion"], "1.0");
        assert_eq!(json["nTables"], 254);
        assert_eq!(json["capabilities"][3], "QUEUE_STATS");
    }
}
