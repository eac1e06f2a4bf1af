//! SANE network daemon (saned) init and device listing
//!
//! Every value on the wire is a 4-byte big-endian word. Strings are a word
//! length (counting the trailing NUL) followed by the bytes; pointers are a
//! word that is 0 when a value follows and 1 for NULL.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::OnceLock;
use tracing::debug;
use wireprobe_core::{validate_pattern, Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::protocols::pattern;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 6566;

const NET_INIT: u32 = 0;
const NET_GET_DEVICES: u32 = 1;
const NET_EXIT: u32 = 10;
const STATUS_GOOD: u32 = 0;
const MAX_STRING: usize = 4096;
const MAX_DEVICES: usize = 256;

/// Version code this client announces (1.0 build 3)
pub const VERSION_CODE: u32 = version_code(1, 0, 3);

pub const fn version_code(major: u8, minor: u8, build: u16) -> u32 {
    ((major as u32) << 24) | ((minor as u32) << 16) | build as u32
}

#[derive(Debug, Clone)]
pub struct SaneRequest {
    pub target: ProbeTarget,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub name: String,
    pub vendor: String,
    pub model: String,
    #[serde(rename = "type")]
    pub kind: String,
}

pub fn status_name(status: u32) -> &'static str {
    match status {
        0 => "SANE_STATUS_GOOD",
        1 => "SANE_STATUS_UNSUPPORTED",
        2 => "SANE_STATUS_CANCELLED",
        3 => "SANE_STATUS_DEVICE_BUSY",
        4 => "SANE_STATUS_INVAL",
        5 => "SANE_STATUS_EOF",
        6 => "SANE_STATUS_JAMMED",
        7 => "SANE_STATUS_NO_DOCS",
        8 => "SANE_STATUS_COVER_OPEN",
        9 => "SANE_STATUS_IO_ERROR",
        10 => "SANE_STATUS_NO_MEM",
        11 => "SANE_STATUS_ACCESS_DENIED",
        _ => "UNKNOWN",
    }
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32 + 1).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

pub fn encode_init(username: &str) -> Vec<u8> {
    let mut out = NET_INIT.to_be_bytes().to_vec();
    out.extend_from_slice(&VERSION_CODE.to_be_bytes());
    put_string(&mut out, username);
    out
}

async fn read_word(conn: &mut Connection) -> Result<u32> {
    let b = conn.read_exact(4).await?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

async fn read_string(conn: &mut Connection) -> Result<String> {
    let len = read_word(conn).await? as usize;
    if len > MAX_STRING {
        return Err(Error::protocol("SANE", format!("string length {} too large", len)));
    }
    let bytes = conn.read_exact(len).await?;
    Ok(String::from_utf8_lossy(&bytes)
        .trim_end_matches('\0')
        .to_string())
}

async fn read_devices(conn: &mut Connection) -> Result<Vec<Device>> {
    let len = read_word(conn).await? as usize;
    if len > MAX_DEVICES + 1 {
        return Err(Error::protocol("SANE", format!("device list of {} entries", len)));
    }
    let mut devices = Vec::new();
    for _ in 0..len {
        if read_word(conn).await? != 0 {
            continue;
        }
        devices.push(Device {
            name: read_string(conn).await?,
            vendor: read_string(conn).await?,
            model: read_string(conn).await?,
            kind: read_string(conn).await?,
        });
    }
    Ok(devices)
}

pub struct SaneInit;

#[async_trait]
impl Probe for SaneInit {
    type Request = SaneRequest;

    fn name(&self) -> &'static str {
        "SANE"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<SaneRequest> {
        static USER: OnceLock<regex::Regex> = OnceLock::new();

        let target = raw.target(Some(DEFAULT_PORT), None, limits)?;
        let username = raw.str_field("username")?.unwrap_or_else(|| String::from("wireprobe"));
        validate_pattern(&username, pattern(&USER, r"^[A-Za-z0-9._-]{1,64}$"), "Invalid username format")?;
        Ok(SaneRequest { target, username })
    }

    fn target<'a>(&self, request: &'a SaneRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &SaneRequest, conn: &mut Connection) -> Result<Payload> {
        conn.send(&encode_init(&request.username)).await?;
        let status = read_word(conn).await?;
        let version = read_word(conn).await?;

        let mut payload = Payload::new()
            .with("status", status)
            .with("statusName", status_name(status))
            .with(
                "version",
                serde_json::json!({
                    "major": version >> 24,
                    "minor": (version >> 16) & 0xff,
                    "build": version & 0xffff,
                }),
            );
        if status != STATUS_GOOD {
            return Ok(payload);
        }

        conn.send(&NET_GET_DEVICES.to_be_bytes()).await?;
        let devices_status = read_word(conn).await?;
        if devices_status == STATUS_GOOD {
            let devices = read_devices(conn).await?;
            payload.insert("deviceCount", devices.len());
            payload.insert("devices", serde_json::to_value(&devices)?);
        } else {
            payload.insert("devicesStatus", status_name(devices_status));
        }

        if let Err(e) = conn.send(&NET_EXIT.to_be_bytes()).await {
            debug!("SANE_NET_EXIT not delivered: {}", e);
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_encode_init() {
        let init = encode_init("bob");
        assert_eq!(&init[..4], &[0, 0, 0, 0]);
        assert_eq!(&init[4..8], &[1, 0, 0, 3]);
        assert_eq!(&init[8..12], &[0, 0, 0, 4]);
        assert_eq!(&init[12..], b"bob\0");
    }

    #[tokio::test]
    async fn test_init_lists_devices() {
        let port = serve_once(|mut socket| async move {
            let mut init = [0u8; 22];
            socket.read_exact(&mut init).await.unwrap();

            let mut reply = STATUS_GOOD.to_be_bytes().to_vec();
            reply.extend_from_slice(&version_code(1, 0, 3).to_be_bytes());
            socket.write_all(&reply).await.unwrap();

            let mut rpc = [0u8; 4];
            socket.read_exact(&mut rpc).await.unwrap();
            assert_eq!(u32::from_be_bytes(rpc), NET_GET_DEVICES);

            let mut list = STATUS_GOOD.to_be_bytes().to_vec();
            list.extend_from_slice(&2u32.to_be_bytes());
            list.extend_from_slice(&0u32.to_be_bytes());
            for field in ["epson2:net:10.0.0.9", "Epson", "ET-4750", "flatbed scanner"] {
                put_string(&mut list, field);
            }
            list.extend_from_slice(&1u32.to_be_bytes());
            socket.write_all(&list).await.unwrap();
            let _ = socket.read_exact(&mut rpc).await;
        })
        .await;

        let envelope = run(&SaneInit, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["statusName"], "SANE_STATUS_GOOD");
        assert_eq!(json["version"]["build"], 3);
        assert_eq!(json["devices"][0]["model"], "ET-4750");
        assert_eq!(json["devices"][0]["type"], "flatbed scanner");
    }

    #[tokio::test]
    async fn test_access_denied_is_reported() {
        let port = serve_once(|mut socket| async move {
            let mut init = [0u8; 22];
            socket.read_exact(&mut init).await.unwrap();
            let mut reply = 11u32.to_be_bytes().to_vec();
            reply.extend_from_slice(&version_code(1, 0, 3).to_be_bytes());
            socket.write_all(&reply).await.unwrap();
        })
        .await;

        let envelope = run(&SaneInit, local(port)).await;
        assert!(envelope.success);
        let json = envelope.to_json();
        assert_eq!(json["statusName"], "SANE_STATUS_ACCESS_DENIED");
        assert!(json.get("devices").is_none());
    }
}
