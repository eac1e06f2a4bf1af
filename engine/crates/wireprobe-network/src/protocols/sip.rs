//! SIP OPTIONS over TCP or TLS (RFC 3261)
//!
//! Provisional (1xx) responses are skipped; the first final response is
//! reported. Compact header names are expanded before lookup.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::OnceLock;
use uuid::Uuid;
use wireprobe_core::{validate_host, validate_pattern, Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{find, Decoded, FrameDecoder};
use crate::protocols::{pattern, tls_target};
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 5060;
pub const DEFAULT_TLS_PORT: u16 = 5061;

const MAX_HEAD: usize = 16 * 1024;
const MAX_BODY: usize = 64 * 1024;
const MAX_PROVISIONAL: usize = 8;
const BRANCH_MAGIC: &str = "z9hG4bK";

#[derive(Debug, Clone)]
pub struct SipRequest {
    pub target: ProbeTarget,
    pub username: String,
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl SipResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Comma-separated header values, merged across repeated headers
    pub fn list(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    }
}

fn expand_compact(name: &str) -> &str {
    match name {
        "v" => "Via",
        "f" => "From",
        "t" => "To",
        "i" => "Call-ID",
        "m" => "Contact",
        "l" => "Content-Length",
        "c" => "Content-Type",
        "k" => "Supported",
        "s" => "Subject",
        _ => name,
    }
}

fn token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn encode_options(request: &SipRequest, branch: &str, tag: &str, call_id: &str) -> Vec<u8> {
    let transport = if request.target.tls { "TLS" } else { "TCP" };
    let uri = format!("sip:{}@{}", request.username, request.domain);
    format!(
        "OPTIONS {uri} SIP/2.0\r\n\
         Via: SIP/2.0/{transport} wireprobe.invalid;branch={magic}{branch};rport\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:wireprobe@wireprobe.invalid>;tag={tag}\r\n\
         To: <{uri}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 OPTIONS\r\n\
         Contact: <sip:wireprobe@wireprobe.invalid;transport={lower}>\r\n\
         Accept: application/sdp\r\n\
         User-Agent: wireprobe/0.1\r\n\
         Content-Length: 0\r\n\r\n",
        uri = uri,
        transport = transport,
        magic = BRANCH_MAGIC,
        branch = branch,
        tag = tag,
        call_id = call_id,
        lower = transport.to_ascii_lowercase(),
    )
    .into_bytes()
}

/// Frames one SIP response: head, then a Content-Length body
pub struct SipResponseDecoder;

impl FrameDecoder for SipResponseDecoder {
    type Frame = SipResponse;

    fn decode(&self, buf: &[u8]) -> Decoded<SipResponse> {
        if buf.len() >= 4 && !buf.starts_with(b"SIP/") {
            return Decoded::invalid("response does not start with SIP/");
        }
        let head_end = match find(buf, b"\r\n\r\n") {
            Some(pos) => pos,
            None if buf.len() > MAX_HEAD => return Decoded::invalid("response head too large"),
            None => return Decoded::Incomplete,
        };
        let head = String::from_utf8_lossy(&buf[..head_end]);
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if version != "SIP/2.0" {
            return Decoded::invalid(format!("unsupported version {}", version));
        }
        let status = match parts.next().and_then(|s| s.parse::<u16>().ok()) {
            Some(code) if (100..700).contains(&code) => code,
            _ => return Decoded::invalid(format!("bad status line: {}", status_line)),
        };
        let reason = parts.next().unwrap_or_default().to_string();

        let mut headers = Vec::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.push((expand_compact(name.trim()).to_string(), value.trim().to_string()));
            }
        }
        let content_length = match headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
        {
            None => 0,
            Some((_, value)) => match value.parse::<usize>() {
                Ok(length) if length <= MAX_BODY => length,
                Ok(length) => {
                    return Decoded::invalid(format!("Content-Length {} too large", length))
                }
                Err(_) => return Decoded::invalid(format!("bad Content-Length {:?}", value)),
            },
        };

        let total = head_end + 4 + content_length;
        if buf.len() < total {
            return Decoded::Incomplete;
        }
        Decoded::complete(
            SipResponse {
                status,
                reason,
                headers,
                body: buf[head_end + 4..total].to_vec(),
            },
            total,
        )
    }

    fn stage(&self) -> &'static str {
        "awaiting SIP response"
    }
}

pub struct SipOptions;

#[async_trait]
impl Probe for SipOptions {
    type Request = SipRequest;

    fn name(&self) -> &'static str {
        "SIP"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<SipRequest> {
        static USER: OnceLock<regex::Regex> = OnceLock::new();

        let target = tls_target(raw, DEFAULT_PORT, DEFAULT_TLS_PORT, limits)?;
        let username = raw.str_field("username")?.unwrap_or_else(|| String::from("probe"));
        validate_pattern(&username, pattern(&USER, r"^[A-Za-z0-9_.+-]{1,64}$"), "Invalid username format")?;
        let domain = match raw.str_field("domain")? {
            Some(domain) => validate_host(&domain)
                .map_err(|_| Error::validation("Invalid domain format"))?,
            None => target.host.clone(),
        };
        Ok(SipRequest {
            target,
            username,
            domain,
        })
    }

    fn target<'a>(&self, request: &'a SipRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &SipRequest, conn: &mut Connection) -> Result<Payload> {
        let call_id = format!("{}@wireprobe", Uuid::new_v4());
        conn.send(&encode_options(request, &token(16), &token(10), &call_id))
            .await?;

        let mut response = conn.read_frame(&SipResponseDecoder).await?;
        let mut provisional = 0;
        while response.status < 200 {
            provisional += 1;
            if provisional > MAX_PROVISIONAL {
                return Err(Error::protocol("SIP", "no final response after provisional responses"));
            }
            response = conn.read_frame(&SipResponseDecoder).await?;
        }

        if let Some(id) = response.header("Call-ID") {
            if id != call_id {
                return Err(Error::protocol("SIP", "response Call-ID does not match the request"));
            }
        }

        let mut payload = Payload::new()
            .with("statusCode", response.status)
            .with("reasonPhrase", response.reason.clone())
            .with("allow", response.list("Allow"))
            .with("supported", response.list("Supported"));
        for (key, header) in [
            ("server", "Server"),
            ("userAgent", "User-Agent"),
            ("contact", "Contact"),
            ("accept", "Accept"),
        ] {
            if let Some(value) = response.header(header) {
                payload.insert(key, value);
            }
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn call_id_of(request: &str) -> String {
        request
            .lines()
            .find_map(|l| l.strip_prefix("Call-ID: "))
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_encode_options() {
        let request = SipRequest {
            target: ProbeTarget::new("pbx.example.com", 5060, std::time::Duration::from_secs(5)),
            username: "probe".into(),
            domain: "pbx.example.com".into(),
        };
        let text = String::from_utf8(encode_options(&request, "abc", "t1", "cid@x")).unwrap();
        assert!(text.starts_with("OPTIONS sip:probe@pbx.example.com SIP/2.0\r\n"));
        assert!(text.contains("Via: SIP/2.0/TCP wireprobe.invalid;branch=z9hG4bKabc;rport\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_decode_compact_headers() {
        let raw = b"SIP/2.0 200 OK\r\ni: abc\r\nk: replaces, timer\r\nl: 4\r\n\r\nv=0\n";
        match SipResponseDecoder.decode(raw) {
            Decoded::Complete { frame, consumed } => {
                assert_eq!(consumed, raw.len());
                assert_eq!(frame.header("Call-ID"), Some("abc"));
                assert_eq!(frame.list("Supported"), vec!["replaces", "timer"]);
                assert_eq!(frame.body, b"v=0\n");
            }
            _ => panic!("expected a complete response"),
        }
        assert!(matches!(
            SipResponseDecoder.decode(b"HTTP/1.1 200 OK\r\n\r\n"),
            Decoded::Invalid(_)
        ));
    }

    #[test]
    fn test_decode_rejects_bad_content_length() {
        for length in ["18446744073709551615", "99999999999999999999999", "65537", "-4", "x"] {
            let raw = format!("SIP/2.0 200 OK\r\nContent-Length: {}\r\n\r\nv=0\n", length);
            assert!(
                matches!(SipResponseDecoder.decode(raw.as_bytes()), Decoded::Invalid(_)),
                "Content-Length {:?} accepted",
                length
            );
        }
    }

    #[test]
    fn test_username_validation() {
        let raw = RawRequest::new().with("host", "10.0.0.1").with("username", "a b");
        assert!(SipOptions.validate(&raw, &ProbeLimits::default()).is_err());
        let raw = RawRequest::new().with("host", "10.0.0.1").with("tls", true);
        assert_eq!(SipOptions.validate(&raw, &ProbeLimits::default()).unwrap().target.port, 5061);
    }

    #[tokio::test]
    async fn test_options_skips_provisional_response() {
        let port = serve_once(|mut socket| async move {
            let mut buf = vec![0u8; 2048];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let call_id = call_id_of(&request);
            let reply = format!(
                "SIP/2.0 100 Trying\r\nCall-ID: {id}\r\nContent-Length: 0\r\n\r\n\
                 SIP/2.0 200 OK\r\nCall-ID: {id}\r\nServer: Asterisk PBX 18.0\r\n\
                 Allow: INVITE, ACK, OPTIONS\r\nAllow: BYE\r\nContent-Length: 0\r\n\r\n",
                id = call_id
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
        })
        .await;

        let envelope = run(&SipOptions, local(port)).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["server"], "Asterisk PBX 18.0");
        assert_eq!(json["allow"].as_array().unwrap().len(), 4);
    }
}
