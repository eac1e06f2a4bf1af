//! iSCSI discovery session (RFC 7143)
//!
//! Logs in with `SessionType=Discovery`, going straight to the operational
//! stage, then issues `SendTargets=All` and parses the advertised targets.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::OnceLock;
use tracing::debug;
use wireprobe_core::{validate_pattern, Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{ByteReader, LengthPrefixed};
use crate::protocols::pattern;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 3260;
pub const DEFAULT_INITIATOR: &str = "iqn.2024-01.io.wireprobe:probe";

const BHS_LEN: usize = 48;
const LOGIN_REQUEST: u8 = 0x03;
const LOGIN_RESPONSE: u8 = 0x23;
const TEXT_REQUEST: u8 = 0x04;
const TEXT_RESPONSE: u8 = 0x24;
const LOGOUT_REQUEST: u8 = 0x06;
const IMMEDIATE: u8 = 0x40;
const FINAL: u8 = 0x80;
const ISID: [u8; 6] = [0x40, 0x00, 0x01, 0x37, 0x00, 0x00];

#[derive(Debug, Clone)]
pub struct IscsiRequest {
    pub target: ProbeTarget,
    pub initiator_name: String,
}

/// Parsed Basic Header Segment plus data segment
#[derive(Debug, Clone)]
pub struct Pdu {
    pub opcode: u8,
    pub flags: u8,
    pub version_max: u8,
    pub version_active: u8,
    pub itt: u32,
    pub stat_sn: u32,
    pub status_class: u8,
    pub status_detail: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredTarget {
    pub name: String,
    pub addresses: Vec<String>,
}

pub fn status_name(class: u8, detail: u8) -> &'static str {
    match (class, detail) {
        (0, 0) => "Success",
        (1, 1) => "Target moved temporarily",
        (1, 2) => "Target moved permanently",
        (2, 0) => "Initiator error",
        (2, 1) => "Authentication failure",
        (2, 2) => "Authorization failure",
        (2, 3) => "Not found",
        (2, 4) => "Target removed",
        (2, 5) => "Unsupported version",
        (2, 6) => "Too many connections",
        (2, 7) => "Missing parameter",
        (2, 8) => "Can't include in session",
        (2, 9) => "Session type not supported",
        (2, 10) => "Session does not exist",
        (2, 11) => "Invalid during login",
        (3, 0) => "Target error",
        (3, 1) => "Service unavailable",
        (3, 2) => "Out of resources",
        _ => "Unknown",
    }
}

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

fn key_values(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in pairs {
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out
}

fn pdu(bhs: [u8; BHS_LEN], data: &[u8]) -> Vec<u8> {
    let mut out = bhs.to_vec();
    let len = data.len() as u32;
    out[5..8].copy_from_slice(&len.to_be_bytes()[1..]);
    out.extend_from_slice(data);
    out.resize(BHS_LEN + pad4(data.len()), 0);
    out
}

pub fn encode_login(initiator_name: &str, itt: u32) -> Vec<u8> {
    let mut bhs = [0u8; BHS_LEN];
    bhs[0] = IMMEDIATE | LOGIN_REQUEST;
    // Transit from operational negotiation (1) to full feature phase (3)
    bhs[1] = FINAL | (1 << 2) | 3;
    bhs[8..14].copy_from_slice(&ISID);
    bhs[16..20].copy_from_slice(&itt.to_be_bytes());
    let data = key_values(&[
        ("InitiatorName", initiator_name),
        ("SessionType", "Discovery"),
        ("HeaderDigest", "None"),
        ("DataDigest", "None"),
        ("MaxRecvDataSegmentLength", "65536"),
    ]);
    pdu(bhs, &data)
}

pub fn encode_send_targets(itt: u32, cmd_sn: u32, exp_stat_sn: u32) -> Vec<u8> {
    let mut bhs = [0u8; BHS_LEN];
    bhs[0] = IMMEDIATE | TEXT_REQUEST;
    bhs[1] = FINAL;
    bhs[16..20].copy_from_slice(&itt.to_be_bytes());
    bhs[20..24].copy_from_slice(&u32::MAX.to_be_bytes());
    bhs[24..28].copy_from_slice(&cmd_sn.to_be_bytes());
    bhs[28..32].copy_from_slice(&exp_stat_sn.to_be_bytes());
    pdu(bhs, &key_values(&[("SendTargets", "All")]))
}

pub fn encode_logout(itt: u32, cmd_sn: u32, exp_stat_sn: u32) -> Vec<u8> {
    let mut bhs = [0u8; BHS_LEN];
    bhs[0] = IMMEDIATE | LOGOUT_REQUEST;
    bhs[1] = FINAL;
    bhs[16..20].copy_from_slice(&itt.to_be_bytes());
    bhs[24..28].copy_from_slice(&cmd_sn.to_be_bytes());
    bhs[28..32].copy_from_slice(&exp_stat_sn.to_be_bytes());
    pdu(bhs, &[])
}

pub fn pdu_decoder() -> LengthPrefixed<impl Fn(&[u8]) -> std::result::Result<usize, String>> {
    LengthPrefixed::new(BHS_LEN, |bhs: &[u8]| {
        let ahs = bhs[4] as usize * 4;
        let data = u32::from_be_bytes([0, bhs[5], bhs[6], bhs[7]]) as usize;
        Ok(BHS_LEN + ahs + pad4(data))
    })
    .max_len(256 * 1024)
}

pub fn decode_pdu(frame: &[u8]) -> Result<Pdu> {
    let mut r = ByteReader::new("iSCSI", frame);
    let opcode = r.u8("opcode")? & 0x3f;
    let flags = r.u8("flags")?;
    let version_max = r.u8("version max")?;
    let version_active = r.u8("version active")?;
    let ahs_len = r.u8("AHS length")? as usize * 4;
    let [d0, d1, d2] = r.array::<3>("data segment length")?;
    let data_len = u32::from_be_bytes([0, d0, d1, d2]) as usize;
    r.skip(8, "LUN/ISID")?;
    let itt = r.u32_be("initiator task tag")?;
    r.skip(4, "target transfer tag")?;
    let stat_sn = r.u32_be("StatSN")?;
    r.skip(8, "ExpCmdSN/MaxCmdSN")?;
    let status_class = r.u8("status class")?;
    let status_detail = r.u8("status detail")?;
    r.skip(10, "reserved")?;
    r.skip(ahs_len, "additional header segments")?;
    let data = r.bytes(data_len, "data segment")?.to_vec();

    Ok(Pdu {
        opcode,
        flags,
        version_max,
        version_active,
        itt,
        stat_sn,
        status_class,
        status_detail,
        data,
    })
}

/// Split a text data segment into `key=value` pairs
pub fn parse_key_values(data: &[u8]) -> Vec<(String, String)> {
    data.split(|b| *b == 0)
        .filter(|item| !item.is_empty())
        .filter_map(|item| {
            let text = String::from_utf8_lossy(item);
            let (key, value) = text.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Group `TargetAddress` entries under the preceding `TargetName`
pub fn parse_targets(data: &[u8]) -> Vec<DiscoveredTarget> {
    let mut targets: Vec<DiscoveredTarget> = Vec::new();
    for (key, value) in parse_key_values(data) {
        match key.as_str() {
            "TargetName" => targets.push(DiscoveredTarget {
                name: value,
                addresses: Vec::new(),
            }),
            "TargetAddress" => {
                if let Some(current) = targets.last_mut() {
                    current.addresses.push(value);
                }
            }
            _ => {}
        }
    }
    targets
}

async fn read_pdu(conn: &mut Connection, expected: u8) -> Result<Pdu> {
    let frame = conn.read_frame(&pdu_decoder()).await?;
    let pdu = decode_pdu(&frame)?;
    if pdu.opcode != expected {
        return Err(Error::protocol(
            "iSCSI",
            format!("expected opcode {:#04x}, got {:#04x}", expected, pdu.opcode),
        ));
    }
    Ok(pdu)
}

pub struct IscsiDiscover;

#[async_trait]
impl Probe for IscsiDiscover {
    type Request = IscsiRequest;

    fn name(&self) -> &'static str {
        "iSCSI"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<IscsiRequest> {
        static NAME: OnceLock<regex::Regex> = OnceLock::new();

        let target = raw.target(Some(DEFAULT_PORT), None, limits)?;
        let initiator_name = raw
            .str_field("initiatorName")?
            .unwrap_or_else(|| DEFAULT_INITIATOR.to_string());
        validate_pattern(
            &initiator_name,
            pattern(
                &NAME,
                r"^(iqn\.[0-9]{4}-[0-9]{2}\.[A-Za-z0-9.-]{1,128}(:[A-Za-z0-9.:_-]{1,80})?|eui\.[0-9A-Fa-f]{16})$",
            ),
            "Invalid initiatorName (expected iqn. or eui. form)",
        )?;
        Ok(IscsiRequest { target, initiator_name })
    }

    fn target<'a>(&self, request: &'a IscsiRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &IscsiRequest, conn: &mut Connection) -> Result<Payload> {
        conn.send(&encode_login(&request.initiator_name, 1)).await?;
        let login = read_pdu(conn, LOGIN_RESPONSE).await?;

        let mut payload = Payload::new()
            .with("loginStatusClass", login.status_class)
            .with("loginStatusDetail", login.status_detail)
            .with("loginStatusName", status_name(login.status_class, login.status_detail))
            .with("versionMax", login.version_max)
            .with("versionActive", login.version_active);

        if login.status_class != 0 {
            payload.insert("targets", serde_json::Value::Array(Vec::new()));
            return Ok(payload);
        }

        let exp_stat_sn = login.stat_sn.wrapping_add(1);
        conn.send(&encode_send_targets(2, 1, exp_stat_sn)).await?;
        let text = read_pdu(conn, TEXT_RESPONSE).await?;
        let targets = parse_targets(&text.data);
        // Continue bit: the target has more text than fits one response
        if text.flags & 0x40 != 0 {
            payload.insert("truncated", true);
        }

        if let Err(e) = conn.send(&encode_logout(3, 1, exp_stat_sn.wrapping_add(1))).await {
            debug!("logout not delivered: {}", e);
        }

        payload.insert("targetCount", targets.len());
        payload.insert("targets", serde_json::to_value(&targets)?);
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn response(opcode: u8, status_class: u8, data: &[u8]) -> Vec<u8> {
        let mut bhs = [0u8; BHS_LEN];
        bhs[0] = opcode;
        bhs[1] = FINAL;
        bhs[24..28].copy_from_slice(&7u32.to_be_bytes());
        bhs[36] = status_class;
        pdu(bhs, data)
    }

    async fn read_request(socket: &mut TcpStream) -> Vec<u8> {
        let mut bhs = [0u8; BHS_LEN];
        socket.read_exact(&mut bhs).await.unwrap();
        let len = u32::from_be_bytes([0, bhs[5], bhs[6], bhs[7]]) as usize;
        let mut data = vec![0u8; pad4(len)];
        socket.read_exact(&mut data).await.unwrap();
        data.truncate(len);
        data
    }

    #[test]
    fn test_login_pdu_layout() {
        let login = encode_login(DEFAULT_INITIATOR, 1);
        assert_eq!(login[0], 0x43);
        assert_eq!(login[1], 0x87);
        assert_eq!(login.len() % 4, 0);
        let decoded = decode_pdu(&login).unwrap();
        let pairs = parse_key_values(&decoded.data);
        assert!(pairs.contains(&("SessionType".to_string(), "Discovery".to_string())));
    }

    #[test]
    fn test_parse_targets() {
        let data = b"TargetName=iqn.2001-04.com.example:disk1\0TargetAddress=10.0.0.5:3260,1\0\
TargetAddress=[fe80::1]:3260,1\0TargetName=iqn.2001-04.com.example:disk2\0";
        let targets = parse_targets(data);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].addresses.len(), 2);
        assert!(targets[1].addresses.is_empty());
    }

    #[test]
    fn test_initiator_validation() {
        let limits = ProbeLimits::default();
        let raw = RawRequest::new().with("host", "10.0.0.1").with("initiatorName", "not a name");
        assert!(IscsiDiscover.validate(&raw, &limits).is_err());
        let raw = RawRequest::new()
            .with("host", "10.0.0.1")
            .with("initiatorName", "eui.02004567A425678D");
        assert!(IscsiDiscover.validate(&raw, &limits).is_ok());
    }

    #[tokio::test]
    async fn test_discover_against_fake_target() {
        let port = serve_once(|mut socket| async move {
            read_request(&mut socket).await;
            socket.write_all(&response(LOGIN_RESPONSE, 0, b"")).await.unwrap();
            let text = read_request(&mut socket).await;
            assert_eq!(text, b"SendTargets=All\0");
            let data = b"TargetName=iqn.2001-04.com.example:storage\0TargetAddress=192.168.1.20:3260,1\0";
            socket.write_all(&response(TEXT_RESPONSE, 0, data)).await.unwrap();
            let _ = read_request(&mut socket).await;
        })
        .await;

        let envelope = run(&IscsiDiscover, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["loginStatusName"], "Success");
        assert_eq!(json["targets"][0]["name"], "iqn.2001-04.com.example:storage");
        assert_eq!(json["targets"][0]["addresses"][0], "192.168.1.20:3260,1");
    }

    #[tokio::test]
    async fn test_login_failure_is_reported() {
        let port = serve_once(|mut socket| async move {
            read_request(&mut socket).await;
            let mut reply = response(LOGIN_RESPONSE, 2, b"");
            reply[37] = 1;
            socket.write_all(&reply).await.unwrap();
        })
        .await;

        let envelope = run(&IscsiDiscover, local(port)).await;
        assert!(envelope.success);
        assert_eq!(envelope.to_json()["loginStatusName"], "Authentication failure");
    }
}
