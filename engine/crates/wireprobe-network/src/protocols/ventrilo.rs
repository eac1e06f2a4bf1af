//! Ventrilo TCP port check
//!
//! The Ventrilo control protocol is proprietary and encrypted; the probe
//! connects, waits briefly for anything the server volunteers, and reports
//! the raw bytes.

use async_trait::async_trait;
use std::time::Duration;
use wireprobe_core::{Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::protocols::plain_target;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 3784;

const MAX_BANNER: usize = 512;
const BANNER_WAIT: Duration = Duration::from_millis(1000);

pub struct VentriloConnect;

#[async_trait]
impl Probe for VentriloConnect {
    type Request = ProbeTarget;

    fn name(&self) -> &'static str {
        "Ventrilo"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ProbeTarget> {
        plain_target(raw, DEFAULT_PORT, limits)
    }

    fn target<'a>(&self, request: &'a ProbeTarget) -> &'a ProbeTarget {
        request
    }

    async fn handshake(&self, _target: &ProbeTarget, conn: &mut Connection) -> Result<Payload> {
        let banner = conn.read_available(MAX_BANNER, BANNER_WAIT).await?;
        Ok(Payload::new()
            .with("connected", true)
            .with("bytesReceived", banner.len())
            .with("bannerHex", hex::encode(&banner)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_banner_is_hex_encoded() {
        let port = serve_once(|mut socket| async move {
            socket.write_all(&[0x00, 0x01, 0xAB]).await.unwrap();
        })
        .await;

        let envelope = run(&VentriloConnect, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["bytesReceived"], 3);
        assert_eq!(json["bannerHex"], "0001ab");
    }

    #[tokio::test]
    async fn test_silent_server_still_connects() {
        let port = serve_once(|socket| async move {
            let _held = socket;
            tokio::time::sleep(Duration::from_secs(2)).await;
        })
        .await;

        let envelope = run(&VentriloConnect, local(port).with("timeout", 3000)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        assert_eq!(envelope.to_json()["bytesReceived"], 0);
    }
}
