//! SSH identification exchange and KEXINIT (RFC 4253 sections 4.2 and 7.1)

use async_trait::async_trait;
use serde::Serialize;
use std::sync::OnceLock;
use wireprobe_core::{Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{ByteReader, Delimited, LengthPrefixed};
use crate::protocols::{pattern, plain_target};
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 22;

pub const CLIENT_IDENT: &[u8] = b"SSH-2.0-wireprobe_0.1\r\n";

/// Servers may send other lines before their identification string
const MAX_PRELUDE_LINES: usize = 20;
const MAX_PACKET_LEN: usize = 35000;
const MSG_KEXINIT: u8 = 20;

/// Parsed identification string
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    pub banner: String,
    pub protocol_version: String,
    pub software_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_version: Option<String>,
}

/// Algorithm name-lists from the server's KEXINIT
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KexInit {
    pub cookie: String,
    pub kex_algorithms: Vec<String>,
    pub host_key_algorithms: Vec<String>,
    pub ciphers: Vec<String>,
    pub macs: Vec<String>,
    pub compression: Vec<String>,
    pub first_kex_packet_follows: bool,
}

pub fn parse_identification(line: &str) -> Result<Identification> {
    static PRODUCT: OnceLock<regex::Regex> = OnceLock::new();

    let banner = line.trim_end_matches(['\r', '\n']).to_string();
    let Some(rest) = banner.strip_prefix("SSH-") else {
        return Err(Error::protocol("SSH", format!("not an SSH identification: {:?}", banner)));
    };
    let (protocol_version, software) = rest
        .split_once('-')
        .ok_or_else(|| Error::protocol("SSH", "identification lacks a software version"))?;
    if !matches!(protocol_version, "2.0" | "1.99" | "1.5") {
        return Err(Error::protocol(
            "SSH",
            format!("unsupported protocol version {}", protocol_version),
        ));
    }
    let protocol_version = protocol_version.to_string();
    let (software_version, comments) = match software.split_once(' ') {
        Some((software, comments)) => (software.to_string(), Some(comments.to_string())),
        None => (software.to_string(), None),
    };

    let captures = pattern(&PRODUCT, r"^([A-Za-z][A-Za-z0-9.]*?)[_-](\d+[\w.]*)").captures(&software_version);
    let product = captures.as_ref().and_then(|c| c.get(1)).map(|m| m.as_str().to_string());
    let product_version = captures.as_ref().and_then(|c| c.get(2)).map(|m| m.as_str().to_string());

    Ok(Identification {
        banner,
        protocol_version,
        software_version,
        comments,
        product,
        product_version,
    })
}

/// Read lines until the identification string arrives
async fn read_identification(conn: &mut Connection) -> Result<Identification> {
    let line_decoder = Delimited::new(b"\n", 255);
    for _ in 0..MAX_PRELUDE_LINES {
        let line = conn.read_frame(&line_decoder).await?;
        let text = String::from_utf8_lossy(&line);
        if text.starts_with("SSH-") {
            return parse_identification(&text);
        }
    }
    Err(Error::protocol(
        "SSH",
        format!("no identification string within {} lines", MAX_PRELUDE_LINES),
    ))
}

pub fn packet_decoder() -> LengthPrefixed<impl Fn(&[u8]) -> std::result::Result<usize, String>> {
    LengthPrefixed::new(5, |header: &[u8]| {
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_PACKET_LEN {
            return Err(format!("packet length {} exceeds {}", len, MAX_PACKET_LEN));
        }
        if (header[4] as usize) + 1 > len {
            return Err(format!("padding length {} exceeds packet length {}", header[4], len));
        }
        Ok(4 + len)
    })
}

fn name_list(r: &mut ByteReader<'_>, field: &str) -> Result<Vec<String>> {
    let len = r.u32_be(field)? as usize;
    let text = r.text(len, field)?;
    Ok(text
        .split(',')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}

/// Parse an unencrypted binary packet carrying KEXINIT
pub fn decode_kexinit(packet: &[u8]) -> Result<KexInit> {
    let mut r = ByteReader::new("SSH", packet);
    let packet_len = r.u32_be("packet length")? as usize;
    let padding = r.u8("padding length")? as usize;
    let payload_len = packet_len
        .checked_sub(padding + 1)
        .ok_or_else(|| r.error("padding exceeds packet length"))?;
    let payload = r.bytes(payload_len, "payload")?;

    let mut p = ByteReader::new("SSH", payload);
    let kind = p.u8("message type")?;
    if kind != MSG_KEXINIT {
        return Err(p.error(format!("expected KEXINIT (20), got message {}", kind)));
    }
    let cookie = hex::encode(p.bytes(16, "cookie")?);
    let kex_algorithms = name_list(&mut p, "kex algorithms")?;
    let host_key_algorithms = name_list(&mut p, "host key algorithms")?;
    let ciphers = name_list(&mut p, "ciphers client to server")?;
    name_list(&mut p, "ciphers server to client")?;
    let macs = name_list(&mut p, "macs client to server")?;
    name_list(&mut p, "macs server to client")?;
    let compression = name_list(&mut p, "compression client to server")?;
    name_list(&mut p, "compression server to client")?;
    name_list(&mut p, "languages client to server")?;
    name_list(&mut p, "languages server to client")?;
    let first_kex_packet_follows = p.u8("first kex packet follows")? != 0;

    Ok(KexInit {
        cookie,
        kex_algorithms,
        host_key_algorithms,
        ciphers,
        macs,
        compression,
        first_kex_packet_follows,
    })
}

pub struct SshBanner;

#[async_trait]
impl Probe for SshBanner {
    type Request = ProbeTarget;

    fn name(&self) -> &'static str {
        "SSH"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ProbeTarget> {
        plain_target(raw, DEFAULT_PORT, limits)
    }

    fn target<'a>(&self, request: &'a ProbeTarget) -> &'a ProbeTarget {
        request
    }

    async fn handshake(&self, _target: &ProbeTarget, conn: &mut Connection) -> Result<Payload> {
        let ident = read_identification(conn).await?;
        Payload::from_serialize(&ident)
    }
}

pub struct SshKexInit;

#[async_trait]
impl Probe for SshKexInit {
    type Request = ProbeTarget;

    fn name(&self) -> &'static str {
        "SSH"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ProbeTarget> {
        plain_target(raw, DEFAULT_PORT, limits)
    }

    fn target<'a>(&self, request: &'a ProbeTarget) -> &'a ProbeTarget {
        request
    }

    async fn handshake(&self, _target: &ProbeTarget, conn: &mut Connection) -> Result<Payload> {
        let ident = read_identification(conn).await?;
        let packet = conn.exchange(CLIENT_IDENT, &packet_decoder()).await?;
        let kexinit = decode_kexinit(&packet)?;

        let mut payload = Payload::from_serialize(&ident)?;
        for (key, value) in Payload::from_serialize(&kexinit)?.into_inner() {
            payload.insert(&key, value);
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn kexinit_packet() -> Vec<u8> {
        let mut payload = vec![MSG_KEXINIT];
        payload.extend_from_slice(&[7u8; 16]);
        for list in [
            "curve25519-sha256,diffie-hellman-group14-sha256",
            "ssh-ed25519,rsa-sha2-512",
            "chacha20-poly1305@openssh.com,aes256-gcm@openssh.com",
            "chacha20-poly1305@openssh.com",
            "hmac-sha2-256",
            "hmac-sha2-256",
            "none,zlib@openssh.com",
            "none",
            "",
            "",
        ] {
            payload.extend_from_slice(&(list.len() as u32).to_be_bytes());
            payload.extend_from_slice(list.as_bytes());
        }
        payload.push(0);
        payload.extend_from_slice(&[0, 0, 0, 0]);

        let padding = 8 - (payload.len() + 5) % 8 + 4;
        let mut packet = ((payload.len() + padding + 1) as u32).to_be_bytes().to_vec();
        packet.push(padding as u8);
        packet.extend_from_slice(&payload);
        packet.extend(std::iter::repeat(0).take(padding));
        packet
    }

    #[test]
    fn test_parse_identification() {
        let ident = parse_identification("SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.6\r\n").unwrap();
        assert_eq!(ident.protocol_version, "2.0");
        assert_eq!(ident.software_version, "OpenSSH_8.9p1");
        assert_eq!(ident.comments.as_deref(), Some("Ubuntu-3ubuntu0.6"));
        assert_eq!(ident.product.as_deref(), Some("OpenSSH"));
        assert_eq!(ident.product_version.as_deref(), Some("8.9p1"));

        assert!(parse_identification("HTTP/1.1 400 Bad Request").is_err());
        assert!(parse_identification("SSH-3.0-future").is_err());
    }

    #[test]
    fn test_decode_kexinit() {
        let kex = decode_kexinit(&kexinit_packet()).unwrap();
        assert_eq!(kex.kex_algorithms[0], "curve25519-sha256");
        assert_eq!(kex.host_key_algorithms, vec!["ssh-ed25519", "rsa-sha2-512"]);
        assert_eq!(kex.compression, vec!["none", "zlib@openssh.com"]);
        assert!(!kex.first_kex_packet_follows);
    }

    #[tokio::test]
    async fn test_banner_skips_prelude_lines() {
        let port = serve_once(|mut socket| async move {
            socket
                .write_all(b"Welcome to the bastion\r\nSSH-2.0-dropbear_2022.83\r\n")
                .await
                .unwrap();
        })
        .await;

        let envelope = run(&SshBanner, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["softwareVersion"], "dropbear_2022.83");
        assert_eq!(json["product"], "dropbear");
    }

    #[tokio::test]
    async fn test_kexinit_against_fake_server() {
        let port = serve_once(|mut socket| async move {
            socket.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
            let mut ident = vec![0u8; CLIENT_IDENT.len()];
            socket.read_exact(&mut ident).await.unwrap();
            socket.write_all(&kexinit_packet()).await.unwrap();
        })
        .await;

        let envelope = run(&SshKexInit, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["productVersion"], "9.6");
        assert_eq!(json["macs"][0], "hmac-sha2-256");
    }
}
