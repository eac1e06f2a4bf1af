//! Omron FINS over TCP
//!
//! A FINS/TCP session opens with a node address exchange (command 0/1). Once
//! the server has assigned nodes, a Controller Data Read (0501) frame is sent
//! to learn the controller model; that second step is best effort.

use async_trait::async_trait;
use tracing::debug;
use wireprobe_core::{Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{ByteReader, LengthPrefixed};
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 9600;

const MAGIC: &[u8; 4] = b"FINS";
const HEADER_LEN: usize = 16;
const NODE_REQUEST: u32 = 0;
const NODE_RESPONSE: u32 = 1;
const FRAME_SEND: u32 = 2;

#[derive(Debug, Clone)]
pub struct FinsRequest {
    pub target: ProbeTarget,
    pub client_node: u8,
}

/// Node addresses assigned by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAssignment {
    pub client_node: u32,
    pub server_node: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerData {
    pub model: String,
    pub version: String,
}

pub fn tcp_error_name(code: u32) -> &'static str {
    match code {
        0x00 => "Normal",
        0x01 => "Header is not FINS",
        0x02 => "Data length too long",
        0x03 => "Command not supported",
        0x20 => "All connections are in use",
        0x21 => "Specified node is already connected",
        0x22 => "Attempt to access a protected node from an unspecified IP address",
        0x23 => "Client FINS node address out of range",
        0x24 => "Same FINS node address used by client and server",
        0x25 => "All node addresses available for allocation are in use",
        _ => "Unknown",
    }
}

fn header(command: u32, body_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&((8 + body_len) as u32).to_be_bytes());
    out.extend_from_slice(&command.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out
}

pub fn encode_node_request(client_node: u8) -> Vec<u8> {
    let mut out = header(NODE_REQUEST, 4);
    out.extend_from_slice(&(client_node as u32).to_be_bytes());
    out
}

pub fn encode_controller_read(nodes: NodeAssignment, sid: u8) -> Vec<u8> {
    let frame = [
        0x80, // ICF: command, response required
        0x00,
        0x02,
        0x00,
        nodes.server_node as u8,
        0x00,
        0x00,
        nodes.client_node as u8,
        0x00,
        sid,
        0x05,
        0x01,
    ];
    let mut out = header(FRAME_SEND, frame.len());
    out.extend_from_slice(&frame);
    out
}

pub fn message_decoder() -> LengthPrefixed<impl Fn(&[u8]) -> std::result::Result<usize, String>> {
    LengthPrefixed::new(8, |header: &[u8]| {
        if &header[..4] != MAGIC {
            return Err(String::from("missing FINS header"));
        }
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len < 8 {
            return Err(format!("declared length {} is shorter than the command header", len));
        }
        Ok(8 + len)
    })
    .max_len(4096)
}

fn split_message(frame: &[u8], expected: u32) -> Result<&[u8]> {
    let mut r = ByteReader::new("FINS", frame);
    r.skip(8, "header")?;
    let command = r.u32_be("command")?;
    let error = r.u32_be("error code")?;
    if error != 0 {
        return Err(Error::rejected(
            "FINS",
            format!("{} ({:#04x})", tcp_error_name(error), error),
        ));
    }
    if command != expected {
        return Err(r.error(format!("expected command {}, got {}", expected, command)));
    }
    Ok(r.rest())
}

pub fn decode_node_response(frame: &[u8]) -> Result<NodeAssignment> {
    let body = split_message(frame, NODE_RESPONSE)?;
    let mut r = ByteReader::new("FINS", body);
    Ok(NodeAssignment {
        client_node: r.u32_be("client node")?,
        server_node: r.u32_be("server node")?,
    })
}

fn padded_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|c: char| c == '\0' || c == ' ')
        .to_string()
}

pub fn decode_controller_data(frame: &[u8], sid: u8) -> Result<ControllerData> {
    let body = split_message(frame, FRAME_SEND)?;
    let mut r = ByteReader::new("FINS", body);
    r.skip(9, "response header")?;
    if r.u8("service id")? != sid {
        return Err(r.error("service id does not match the request"));
    }
    let command = r.u16_be("command code")?;
    if command != 0x0501 {
        return Err(r.error(format!("expected 0501 response, got {:04x}", command)));
    }
    let end_code = r.u16_be("end code")?;
    if end_code & 0x7f3f != 0 {
        return Err(Error::rejected("FINS", format!("controller data read end code {:04x}", end_code)));
    }
    Ok(ControllerData {
        model: padded_text(r.bytes(20, "controller model")?),
        version: padded_text(r.bytes(20, "controller version")?),
    })
}

pub struct FinsConnect;

#[async_trait]
impl Probe for FinsConnect {
    type Request = FinsRequest;

    fn name(&self) -> &'static str {
        "FINS"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<FinsRequest> {
        let target = raw.target(Some(DEFAULT_PORT), None, limits)?;
        let client_node = raw.ranged_field("clientNode", 0, 254)?.unwrap_or(0) as u8;
        Ok(FinsRequest { target, client_node })
    }

    fn target<'a>(&self, request: &'a FinsRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &FinsRequest, conn: &mut Connection) -> Result<Payload> {
        let decoder = message_decoder();
        let frame = conn
            .exchange(&encode_node_request(request.client_node), &decoder)
            .await?;
        let nodes = decode_node_response(&frame)?;

        let mut payload = Payload::new()
            .with("clientNode", nodes.client_node)
            .with("serverNode", nodes.server_node);

        let sid = 0x01;
        let controller = match conn.exchange(&encode_controller_read(nodes, sid), &decoder).await {
            Ok(frame) => decode_controller_data(&frame, sid),
            Err(e) => Err(e),
        };
        match controller {
            Ok(data) => {
                payload.insert("controllerModel", data.model);
                payload.insert("controllerVersion", data.version);
            }
            Err(e) => debug!("controller data read skipped: {}", e),
        }
        Ok(payload)
    }
}
