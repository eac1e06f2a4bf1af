//! Beanstalkd text protocol: `stats` and `list-tubes`
//!
//! Both commands answer `OK <bytes>\r\n<yaml>\r\n`; anything else on the
//! first line is a server error word such as `UNKNOWN_COMMAND`.

use async_trait::async_trait;
use serde_json::{Map, Value};
use wireprobe_core::{Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{find, Decoded, FrameDecoder, MAX_FRAME_LEN};
use crate::protocols::plain_target;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 11300;

/// A complete server reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok(String),
    Error(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyDecoder;

impl FrameDecoder for ReplyDecoder {
    type Frame = Reply;

    fn decode(&self, buf: &[u8]) -> Decoded<Reply> {
        let Some(line_end) = find(buf, b"\r\n") else {
            if buf.len() > 256 {
                return Decoded::invalid("status line exceeds 256 bytes");
            }
            return Decoded::Incomplete;
        };
        let line = String::from_utf8_lossy(&buf[..line_end]);
        let Some(size) = line.strip_prefix("OK ") else {
            return Decoded::complete(Reply::Error(line.trim().to_string()), line_end + 2);
        };
        let size = match size.trim().parse::<usize>() {
            Ok(size) if size <= MAX_FRAME_LEN => size,
            _ => return Decoded::invalid(format!("bad OK line {:?}", line)),
        };

        let start = line_end + 2;
        let total = start + size + 2;
        if buf.len() < total {
            return Decoded::Incomplete;
        }
        if &buf[start + size..total] != b"\r\n" {
            return Decoded::invalid("data block not terminated by CRLF");
        }
        let body = String::from_utf8_lossy(&buf[start..start + size]).into_owned();
        Decoded::complete(Reply::Ok(body), total)
    }

    fn stage(&self) -> &'static str {
        "awaiting beanstalkd reply"
    }
}

fn scalar(value: &str) -> Value {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        return Value::String(value[1..value.len() - 1].to_string());
    }
    if let Ok(n) = value.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = value.parse::<f64>() {
        return Value::from(f);
    }
    Value::String(value.to_string())
}

/// Flat YAML dictionary, as emitted by `stats`
pub fn parse_yaml_map(body: &str) -> Map<String, Value> {
    body.lines()
        .filter(|line| *line != "---")
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), scalar(v)))
        .collect()
}

/// YAML sequence of scalars, as emitted by `list-tubes`
pub fn parse_yaml_list(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.trim().strip_prefix("- "))
        .map(|item| item.trim().trim_matches('"').to_string())
        .collect()
}

async fn command(conn: &mut Connection, line: &[u8]) -> Result<String> {
    match conn.exchange(line, &ReplyDecoder).await? {
        Reply::Ok(body) => Ok(body),
        Reply::Error(word) => Err(Error::rejected(
            "Beanstalkd",
            format!("server answered {}", word),
        )),
    }
}

pub struct BeanstalkdStats;

#[async_trait]
impl Probe for BeanstalkdStats {
    type Request = ProbeTarget;

    fn name(&self) -> &'static str {
        "Beanstalkd"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ProbeTarget> {
        plain_target(raw, DEFAULT_PORT, limits)
    }

    fn target<'a>(&self, request: &'a ProbeTarget) -> &'a ProbeTarget {
        request
    }

    async fn handshake(&self, _target: &ProbeTarget, conn: &mut Connection) -> Result<Payload> {
        let stats = parse_yaml_map(&command(conn, b"stats\r\n").await?);
        if stats.is_empty() {
            return Err(Error::protocol("Beanstalkd", "stats reply carried no fields"));
        }

        let mut payload = Payload::new();
        for (field, key) in [
            ("version", "version"),
            ("uptime", "uptime"),
            ("currentJobsReady", "current-jobs-ready"),
            ("currentJobsReserved", "current-jobs-reserved"),
            ("currentTubes", "current-tubes"),
            ("currentConnections", "current-connections"),
            ("totalJobs", "total-jobs"),
        ] {
            if let Some(value) = stats.get(key) {
                payload.insert(field, value.clone());
            }
        }
        payload.insert("stats", Value::Object(stats));
        Ok(payload)
    }
}

pub struct BeanstalkdTubes;

#[async_trait]
impl Probe for BeanstalkdTubes {
    type Request = ProbeTarget;

    fn name(&self) -> &'static str {
        "Beanstalkd"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<ProbeTarget> {
        plain_target(raw, DEFAULT_PORT, limits)
    }

    fn target<'a>(&self, request: &'a ProbeTarget) -> &'a ProbeTarget {
        request
    }

    async fn handshake(&self, _target: &ProbeTarget, conn: &mut Connection) -> Result<Payload> {
        let tubes = parse_yaml_list(&command(conn, b"list-tubes\r\n").await?);
        Ok(Payload::new()
            .with("tubeCount", tubes.len())
            .with("tubes", tubes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn ok(body: &str) -> Vec<u8> {
        format!("OK {}\r\n{}\r\n", body.len(), body).into_bytes()
    }

    #[test]
    fn test_reply_decoder() {
        let bytes = ok("---\nversion: 1.13\n");
        assert_eq!(ReplyDecoder.decode(&bytes[..10]), Decoded::Incomplete);
        assert_eq!(
            ReplyDecoder.decode(&bytes),
            Decoded::complete(Reply::Ok(String::from("---\nversion: 1.13\n")), bytes.len())
        );
        assert_eq!(
            ReplyDecoder.decode(b"UNKNOWN_COMMAND\r\n"),
            Decoded::complete(Reply::Error(String::from("UNKNOWN_COMMAND")), 17)
        );
    }

    #[test]
    fn test_reply_decoder_rejects_bad_sizes() {
        for line in [
            "OK 18446744073709551615\r\n",
            "OK 99999999999999999999999\r\n",
            "OK 1048577\r\n",
            "OK -3\r\n",
            "OK lots\r\n",
        ] {
            assert!(
                matches!(ReplyDecoder.decode(line.as_bytes()), Decoded::Invalid(_)),
                "{:?} accepted",
                line
            );
        }
        assert!(matches!(ReplyDecoder.decode(b"OK 2\r\nabcd"), Decoded::Invalid(_)));
    }

    #[test]
    fn test_yaml_parsing() {
        let map = parse_yaml_map("---\ncurrent-jobs-ready: 3\nversion: \"1.13\"\nrusage-utime: 0.015\n");
        assert_eq!(map["current-jobs-ready"], 3);
        assert_eq!(map["version"], "1.13");
        assert_eq!(map["rusage-utime"], 0.015);
        assert_eq!(parse_yaml_list("---\n- default\n- emails\n"), vec!["default", "emails"]);
    }

    #[tokio::test]
    async fn test_stats_against_fake_server() {
        let port = serve_once(|mut socket| async move {
            let mut line = [0u8; 7];
            socket.read_exact(&mut line).await.unwrap();
            assert_eq!(&line, b"stats\r\n");
            socket
                .write_all(&ok("---\ncurrent-jobs-ready: 4\nversion: 1.12\nuptime: 99\n"))
                .await
                .unwrap();
        })
        .await;

        let envelope = run(&BeanstalkdStats, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["currentJobsReady"], 4);
        assert_eq!(json["stats"]["uptime"], 99);
    }

    #[tokio::test]
    async fn test_server_error_word() {
        let port = serve_once(|mut socket| async move {
            let mut line = [0u8; 12];
            socket.read_exact(&mut line).await.unwrap();
            socket.write_all(b"OUT_OF_MEMORY\r\n").await.unwrap();
        })
        .await;

        let envelope = run(&BeanstalkdTubes, local(port)).await;
        assert!(!envelope.success);
        assert!(envelope.error.unwrap().contains("OUT_OF_MEMORY"));
    }
}
