//! HP JetDirect raw port (9100): PJL `INFO ID`
//!
//! The job is wrapped in Universal Exit Language sequences so the printer
//! treats it as PJL rather than page data. Printers answer with the echoed
//! command, the quoted model string, and a form feed.

use async_trait::async_trait;
use std::time::Duration;
use wireprobe_core::{Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::protocols::plain_target;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 9100;

pub const INFO_ID: &[u8] = b"\x1b%-12345X@PJL INFO ID\r\n\x1b%-12345X\r\n";

const MAX_RESPONSE: usize = 4096;
const IDLE: Duration = Duration::from_millis(500);

/// Model string following the `@PJL INFO ID` echo
pub fn parse_model(response: &str) -> Option<String> {
    let mut lines = response
        .lines()
        .map(|l| l.trim_matches(|c: char| c.is_whitespace() || c == '\x0c'));
    lines.find(|l| l.eq_ignore_ascii_case("@PJL INFO ID"))?;
    lines
        .find(|l| !l.is_empty())
        .map(|l| l.trim_matches('"').to_string())
        .filter(|l| !l.is_empty())
}

pub struct JetDirectInfo;

#[async_trait]
impl Probe for JetDirectInfo {
    type Request = ProbeTarget;

    fn name(&self) -> &'static str {
        "JetDirect"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ProbeTarget> {
        plain_target(raw, DEFAULT_PORT, limits)
    }

    fn target<'a>(&self, request: &'a ProbeTarget) -> &'a ProbeTarget {
        request
    }

    async fn handshake(&self, _target: &ProbeTarget, conn: &mut Connection) -> Result<Payload> {
        conn.send(INFO_ID).await?;
        let response = conn.read_until_idle(MAX_RESPONSE, IDLE).await?;
        let text = String::from_utf8_lossy(&response).into_owned();

        let mut payload = Payload::new().with("pjlSupported", text.contains("@PJL"));
        if let Some(model) = parse_model(&text) {
            payload.insert("model", model);
        }
        payload.insert("rawResponse", text.trim_end_matches(['\x0c', '\r', '\n', '\0']));
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_model() {
        assert_eq!(
            parse_model("@PJL INFO ID\r\n\"HP LaserJet 4250\"\r\n\x0c"),
            Some("HP LaserJet 4250".into())
        );
        assert_eq!(parse_model("garbage"), None);
    }

    #[tokio::test]
    async fn test_info_against_fake_printer() {
        let port = serve_once(|mut socket| async move {
            let mut request = vec![0u8; INFO_ID.len()];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(request, INFO_ID);
            socket
                .write_all(b"@PJL INFO ID\r\n\"HP Color LaserJet M553\"\r\n\x0c")
                .await
                .unwrap();
        })
        .await;

        let envelope = run(&JetDirectInfo, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["model"], "HP Color LaserJet M553");
        assert_eq!(json["pjlSupported"], true);
    }

    #[tokio::test]
    async fn test_silent_printer_times_out() {
        let port = serve_once(|mut socket| async move {
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(3)).await;
        })
        .await;

        let envelope = run(&JetDirectInfo, local(port).with("timeout", 300)).await;
        assert!(!envelope.success);
        assert_eq!(envelope.to_json()["errorCode"], "TIMEOUT");
    }
}
