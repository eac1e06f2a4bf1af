//! VNC / RFB version and security-type negotiation (RFC 6143 section 7.1)
//!
//! The probe stops once the server has listed its security types; it never
//! answers an authentication challenge.

use async_trait::async_trait;
use serde::Serialize;
use wireprobe_core::{Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::protocols::plain_target;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 5900;

const VERSION_LEN: usize = 12;
const MAX_REASON_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityType {
    pub id: u8,
    pub name: &'static str,
}

impl SecurityType {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            name: security_type_name(id),
        }
    }
}

pub fn security_type_name(id: u8) -> &'static str {
    match id {
        0 => "Invalid",
        1 => "None",
        2 => "VNC Authentication",
        5 => "RA2",
        6 => "RA2ne",
        16 => "Tight",
        17 => "Ultra",
        18 => "TLS",
        19 => "VeNCrypt",
        20 => "GTK-VNC SASL",
        21 => "MD5 hash",
        22 => "Colin Dean xvp",
        30 => "Apple Remote Desktop",
        113 => "MS-Logon II",
        _ => "Unknown",
    }
}

/// `RFB xxx.yyy\n` -> (major, minor)
pub fn parse_version(bytes: &[u8]) -> Result<(u16, u16)> {
    let text = String::from_utf8_lossy(bytes);
    let invalid = || Error::protocol("VNC", format!("invalid RFB version string {:?}", text));
    if bytes.len() != VERSION_LEN || !bytes.is_ascii() || !text.starts_with("RFB ") || bytes[11] != b'\n' || bytes[7] != b'.' {
        return Err(invalid());
    }
    let major = text[4..7].parse::<u16>().map_err(|_| invalid())?;
    let minor = text[8..11].parse::<u16>().map_err(|_| invalid())?;
    Ok((major, minor))
}

/// Highest version we speak that the server also offers
pub fn negotiate(major: u16, minor: u16) -> (u16, u16) {
    match (major, minor) {
        (3, m) if m >= 8 => (3, 8),
        (3, 7) => (3, 7),
        (3, _) => (3, 3),
        (m, _) if m > 3 => (3, 8),
        _ => (3, 3),
    }
}

async fn read_reason(conn: &mut Connection) -> Result<String> {
    let len = conn.read_exact(4).await?;
    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if len > MAX_REASON_LEN {
        return Err(Error::protocol("VNC", format!("failure reason of {} bytes", len)));
    }
    let reason = conn.read_exact(len).await?;
    Ok(String::from_utf8_lossy(&reason).into_owned())
}

pub struct VncConnect;

#[async_trait]
impl Probe for VncConnect {
    type Request = ProbeTarget;

    fn name(&self) -> &'static str {
        "VNC"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ProbeTarget> {
        plain_target(raw, DEFAULT_PORT, limits)
    }

    fn target<'a>(&self, request: &'a ProbeTarget) -> &'a ProbeTarget {
        request
    }

    async fn handshake(&self, _target: &ProbeTarget, conn: &mut Connection) -> Result<Payload> {
        let version = conn.read_exact(VERSION_LEN).await?;
        let (major, minor) = parse_version(&version)?;
        let server_version = String::from_utf8_lossy(&version[..11]).into_owned();
        let (n_major, n_minor) = negotiate(major, minor);
        conn.send(format!("RFB {:03}.{:03}\n", n_major, n_minor).as_bytes())
            .await?;

        let types: Vec<u8> = if n_minor >= 7 {
            let count = conn.read_exact(1).await?[0];
            if count == 0 {
                let reason = read_reason(conn).await?;
                return Err(Error::rejected("VNC", format!("server refused connection: {}", reason)));
            }
            conn.read_exact(count as usize).await?
        } else {
            let word = conn.read_exact(4).await?;
            let id = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
            if id == 0 {
                let reason = read_reason(conn).await?;
                return Err(Error::rejected("VNC", format!("server refused connection: {}", reason)));
            }
            let id = u8::try_from(id)
                .map_err(|_| Error::protocol("VNC", format!("invalid security type {}", id)))?;
            vec![id]
        };

        let selected = if types.contains(&1) { 1 } else { types[0] };
        let security_types: Vec<SecurityType> = types.iter().map(|id| SecurityType::new(*id)).collect();

        Ok(Payload::new()
            .with("serverVersion", server_version)
            .with("protocolMajor", major)
            .with("protocolMinor", minor)
            .with("negotiatedVersion", format!("{}.{}", n_major, n_minor))
            .with("securityTypes", serde_json::to_value(&security_types)?)
            .with("selectedSecurityType", serde_json::to_value(SecurityType::new(selected))?)
            .with("authRequired", selected != 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version(b"RFB 003.008\n").unwrap(), (3, 8));
        assert_eq!(parse_version(b"RFB 003.889\n").unwrap(), (3, 889));
        assert!(parse_version(b"SSH-2.0-abc\n").is_err());
        assert!(parse_version(b"RFB 003.008 ").is_err());
    }

    #[test]
    fn test_negotiate() {
        assert_eq!(negotiate(3, 8), (3, 8));
        assert_eq!(negotiate(3, 889), (3, 8));
        assert_eq!(negotiate(3, 7), (3, 7));
        assert_eq!(negotiate(3, 5), (3, 3));
    }

    #[tokio::test]
    async fn test_rfb_38_security_types() {
        let port = serve_once(|mut socket| async move {
            socket.write_all(b"RFB 003.008\n").await.unwrap();
            let mut reply = [0u8; 12];
            socket.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"RFB 003.008\n");
            socket.write_all(&[2, 2, 19]).await.unwrap();
            let mut rest = [0u8; 1];
            let _ = socket.read(&mut rest).await;
        })
        .await;

        let envelope = run(&VncConnect, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["negotiatedVersion"], "3.8");
        assert_eq!(json["securityTypes"][1]["name"], "VeNCrypt");
        assert_eq!(json["selectedSecurityType"]["id"], 2);
        assert_eq!(json["authRequired"], true);
    }

    #[tokio::test]
    async fn test_rfb_33_refusal() {
        let port = serve_once(|mut socket| async move {
            socket.write_all(b"RFB 003.003\n").await.unwrap();
            let mut reply = [0u8; 12];
            socket.read_exact(&mut reply).await.unwrap();
            let reason = b"Too many security failures";
            socket.write_all(&0u32.to_be_bytes()).await.unwrap();
            socket.write_all(&(reason.len() as u32).to_be_bytes()).await.unwrap();
            socket.write_all(reason).await.unwrap();
        })
        .await;

        let envelope = run(&VncConnect, local(port)).await;
        assert!(!envelope.success);
        assert!(envelope.error.unwrap().contains("Too many security failures"));
    }
}
