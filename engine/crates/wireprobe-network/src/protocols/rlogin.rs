//! rlogin connection setup (RFC 1282)
//!
//! The client sends `\0local\0remote\0terminal/speed\0`; the server answers a
//! single NUL on acceptance or `\x01` followed by an error message.

use async_trait::async_trait;
use std::sync::OnceLock;
use std::time::Duration;
use wireprobe_core::{validate_pattern, Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::protocols::pattern;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 513;

const BANNER_WAIT: Duration = Duration::from_millis(500);
const MAX_BANNER: usize = 2048;

#[derive(Debug, Clone)]
pub struct RloginRequest {
    pub target: ProbeTarget,
    pub local_user: String,
    pub remote_user: String,
    pub terminal_type: String,
}

pub fn encode_setup(local_user: &str, remote_user: &str, terminal_type: &str) -> Vec<u8> {
    let mut out = vec![0];
    for part in [local_user, remote_user, terminal_type] {
        out.extend_from_slice(part.as_bytes());
        out.push(0);
    }
    out
}

fn clean(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect::<String>()
        .trim()
        .to_string()
}

pub struct RloginConnect;

#[async_trait]
impl Probe for RloginConnect {
    type Request = RloginRequest;

    fn name(&self) -> &'static str {
        "rlogin"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<RloginRequest> {
        static USER: OnceLock<regex::Regex> = OnceLock::new();
        static TERMINAL: OnceLock<regex::Regex> = OnceLock::new();

        let target = raw.target(Some(DEFAULT_PORT), None, limits)?;
        let local_user = raw.str_field("localUser")?.unwrap_or_else(|| String::from("wireprobe"));
        let remote_user = raw.str_field("remoteUser")?.unwrap_or_else(|| String::from("guest"));
        let terminal_type = raw
            .str_field("terminalType")?
            .unwrap_or_else(|| String::from("xterm/38400"));

        let user = pattern(&USER, r"^[A-Za-z0-9._-]{1,32}$");
        validate_pattern(&local_user, user, "Invalid localUser format")?;
        validate_pattern(&remote_user, user, "Invalid remoteUser format")?;
        validate_pattern(
            &terminal_type,
            pattern(&TERMINAL, r"^[A-Za-z0-9._-]{1,32}/[0-9]{1,6}$"),
            "Invalid terminalType format (expected name/speed)",
        )?;

        Ok(RloginRequest {
            target,
            local_user,
            remote_user,
            terminal_type,
        })
    }

    fn target<'a>(&self, request: &'a RloginRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &RloginRequest, conn: &mut Connection) -> Result<Payload> {
        let setup = encode_setup(&request.local_user, &request.remote_user, &request.terminal_type);
        conn.send(&setup).await?;
        let status = conn.read_exact(1).await?[0];

        match status {
            0 => {
                let banner = conn.read_available(MAX_BANNER, BANNER_WAIT).await?;
                Ok(Payload::new()
                    .with("accepted", true)
                    .with("remoteUser", request.remote_user.clone())
                    .with("banner", clean(&banner)))
            }
            1 => {
                let message = conn.read_available(MAX_BANNER, BANNER_WAIT).await?;
                Ok(Payload::new()
                    .with("accepted", false)
                    .with("remoteUser", request.remote_user.clone())
                    .with("message", clean(&message)))
            }
            other => Err(Error::protocol(
                "rlogin",
                format!("unexpected setup reply byte {:#04x}", other),
            )),
        }
    }
}
