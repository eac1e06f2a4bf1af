//! SOCKS5 CONNECT through a proxy (RFC 1928, RFC 1929)
//!
//! The probe target is the proxy itself; the destination only appears inside
//! the CONNECT request. A non-zero reply code is reported as a named refusal.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use wireprobe_core::{validate_host, Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::transport::Connection;

const VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SocksRequest {
    pub proxy: ProbeTarget,
    pub dest_host: String,
    pub dest_port: u16,
    pub credentials: Option<Credentials>,
}

pub fn reply_name(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned",
    }
}

pub fn method_name(method: u8) -> &'static str {
    match method {
        METHOD_NONE => "none",
        0x01 => "gssapi",
        METHOD_USERPASS => "username/password",
        _ => "unknown",
    }
}

pub fn encode_greeting(with_credentials: bool) -> Vec<u8> {
    if with_credentials {
        vec![VERSION, 2, METHOD_NONE, METHOD_USERPASS]
    } else {
        vec![VERSION, 1, METHOD_NONE]
    }
}

pub fn encode_userpass(credentials: &Credentials) -> Vec<u8> {
    let mut out = vec![0x01, credentials.username.len() as u8];
    out.extend_from_slice(credentials.username.as_bytes());
    out.push(credentials.password.len() as u8);
    out.extend_from_slice(credentials.password.as_bytes());
    out
}

/// CONNECT request; IP literals use their own address types
pub fn encode_connect(host: &str, port: u16) -> Vec<u8> {
    let mut out = vec![VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            out.push(ATYP_DOMAIN);
            out.push(host.len() as u8);
            out.extend_from_slice(host.as_bytes());
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    out
}

async fn read_bound_address(conn: &mut Connection, atyp: u8) -> Result<String> {
    match atyp {
        ATYP_IPV4 => {
            let b = conn.read_exact(4).await?;
            Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]).to_string())
        }
        ATYP_IPV6 => {
            let b = conn.read_exact(16).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&b);
            Ok(Ipv6Addr::from(octets).to_string())
        }
        ATYP_DOMAIN => {
            let len = conn.read_exact(1).await?[0] as usize;
            let name = conn.read_exact(len).await?;
            Ok(String::from_utf8_lossy(&name).into_owned())
        }
        other => Err(Error::protocol(
            "SOCKS5",
            format!("unknown bound address type {:#04x}", other),
        )),
    }
}

fn credential(raw: &RawRequest, key: &str) -> Result<Option<String>> {
    match raw.str_field(key)? {
        Some(value) if value.is_empty() || value.len() > 255 => Err(Error::validation(format!(
            "{} must be between 1 and 255 bytes",
            key
        ))),
        other => Ok(other),
    }
}

pub struct Socks5Connect;

#[async_trait]
impl Probe for Socks5Connect {
    type Request = SocksRequest;

    fn name(&self) -> &'static str {
        "SOCKS5"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<SocksRequest> {
        let proxy_host = raw.host_field("proxyHost")?;
        let proxy_port = raw.port_field("proxyPort", None)?;
        let timeout = raw.timeout(limits.default_timeout, limits)?;

        let dest_host = match raw.str_field("destHost")? {
            Some(host) => validate_host(&host)?,
            None => return Err(Error::validation("Missing required parameter: destHost")),
        };
        if dest_host.len() > 255 {
            return Err(Error::validation("destHost must be at most 255 characters"));
        }
        let dest_port = raw.port_field("destPort", None)?;

        let credentials = match (credential(raw, "username")?, credential(raw, "password")?) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            _ => {
                return Err(Error::validation(
                    "username and password must be supplied together",
                ))
            }
        };

        Ok(SocksRequest {
            proxy: ProbeTarget::new(proxy_host, proxy_port, timeout),
            dest_host,
            dest_port,
            credentials,
        })
    }

    fn target<'a>(&self, request: &'a SocksRequest) -> &'a ProbeTarget {
        &request.proxy
    }

    async fn handshake(&self, request: &SocksRequest, conn: &mut Connection) -> Result<Payload> {
        conn.send(&encode_greeting(request.credentials.is_some())).await?;
        let selection = conn.read_exact(2).await?;
        if selection[0] != VERSION {
            return Err(Error::protocol(
                "SOCKS5",
                format!("unexpected version {:#04x} in method selection", selection[0]),
            ));
        }

        let method = selection[1];
        match (method, &request.credentials) {
            (METHOD_NONE, _) => {}
            (METHOD_USERPASS, Some(credentials)) => {
                conn.send(&encode_userpass(credentials)).await?;
                let status = conn.read_exact(2).await?;
                if status[1] != 0x00 {
                    return Err(Error::rejected(
                        "SOCKS5",
                        format!("username/password authentication failed (status {:#04x})", status[1]),
                    ));
                }
            }
            (METHOD_UNACCEPTABLE, _) => {
                return Err(Error::rejected("SOCKS5", "no acceptable authentication methods"));
            }
            (other, _) => {
                return Err(Error::protocol(
                    "SOCKS5",
                    format!("proxy selected a method that was not offered: {:#04x}", other),
                ));
            }
        }

        conn.send(&encode_connect(&request.dest_host, request.dest_port)).await?;
        let head = conn.read_exact(4).await?;
        if head[0] != VERSION {
            return Err(Error::protocol(
                "SOCKS5",
                format!("unexpected version {:#04x} in CONNECT reply", head[0]),
            ));
        }
        let reply_code = head[1];
        if reply_code != 0x00 {
            return Err(Error::rejected(
                "SOCKS5",
                format!("CONNECT failed: {} ({:#04x})", reply_name(reply_code), reply_code),
            ));
        }
        let bound_address = read_bound_address(conn, head[3]).await?;
        let port = conn.read_exact(2).await?;

        Ok(Payload::new()
            .with("authMethod", method_name(method))
            .with("replyCode", reply_code)
            .with("replyName", reply_name(reply_code))
            .with("boundAddress", bound_address)
            .with("boundPort", u16::from_be_bytes([port[0], port[1]]))
            .with("granted", true)
            .with("destHost", request.dest_host.clone())
            .with("destPort", request.dest_port))
    }
}
