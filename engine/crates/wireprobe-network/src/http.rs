//! Minimal HTTP/1.1 exchange for HTTP-wrapped protocols
//!
//! WinRM and the RabbitMQ management API are probed over a `Connection` so
//! they share the deadline and timing of every other probe. Only what those
//! probes need is supported: one request per connection, and responses
//! framed by Content-Length, chunked encoding or connection close. Status
//! lines, headers and chunk sizes are parsed by `httparse`.

use crate::framing::{find, Decoded, FrameDecoder, MAX_FRAME_LEN};
use crate::transport::Connection;
use wireprobe_core::Result;

/// An outbound request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: &'static str,
    pub path: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: &'static str, path: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            host: host.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", self.method, self.path, self.host);
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if !self.body.is_empty() || self.method == "POST" {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("Connection: close\r\n\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// A decoded response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// First header with this name, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a repeatable header
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

struct Head {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    len: usize,
}

const MAX_HEAD_LEN: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

fn parse_head(buf: &[u8]) -> Decoded<Head> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEAD_LEN => {
            return Decoded::invalid("response headers exceed 64 KiB")
        }
        Ok(httparse::Status::Partial) => return Decoded::Incomplete,
        Err(e) => {
            let line = buf.split(|b| *b == b'\n').next().unwrap_or_default();
            return Decoded::invalid(format!(
                "not an HTTP response ({}): {:?}",
                e,
                truncate(&String::from_utf8_lossy(line))
            ));
        }
    };

    let Some(status) = response.code else {
        return Decoded::invalid("response has no status code");
    };
    let headers = response
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect();

    Decoded::complete(
        Head {
            status,
            reason: response.reason.unwrap_or_default().to_string(),
            headers,
            len,
        },
        len,
    )
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(64) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Decode a chunked body; `None` while more bytes are needed
fn decode_chunked(buf: &[u8]) -> std::result::Result<Option<(Vec<u8>, usize)>, String> {
    let mut body = Vec::new();
    let mut pos = 0;
    loop {
        let (line_len, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(parsed)) => parsed,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(format!("bad chunk size after {} body bytes", body.len())),
        };
        pos += line_len;

        if size == 0 {
            // Trailers end with an empty line
            return match find(&buf[pos..], b"\r\n") {
                Some(0) => Ok(Some((body, pos + 2))),
                Some(_) => match find(&buf[pos..], b"\r\n\r\n") {
                    Some(end) => Ok(Some((body, pos + end + 4))),
                    None => Ok(None),
                },
                None => Ok(None),
            };
        }
        let size = usize::try_from(size)
            .ok()
            .filter(|size| body.len().saturating_add(*size) <= MAX_FRAME_LEN)
            .ok_or_else(|| format!("chunked body exceeds {} bytes", MAX_FRAME_LEN))?;

        // pos <= buf.len() and size <= MAX_FRAME_LEN, so neither sum overflows
        let end = pos + size;
        if buf.len() < end + 2 {
            return Ok(None);
        }
        if &buf[end..end + 2] != b"\r\n" {
            return Err(String::from("chunk data is not followed by CRLF"));
        }
        body.extend_from_slice(&buf[pos..end]);
        pos = end + 2;
    }
}

/// Frames one HTTP/1.1 response
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpResponseDecoder;

impl HttpResponseDecoder {
    fn decode_inner(&self, buf: &[u8], at_eof: bool) -> Decoded<HttpResponse> {
        let head = match parse_head(buf) {
            Decoded::Complete { frame, .. } => frame,
            Decoded::Incomplete => return Decoded::Incomplete,
            Decoded::Invalid(reason) => return Decoded::Invalid(reason),
        };
        let rest = &buf[head.len..];
        let lookup = |name: &str| {
            head.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };

        let no_body = head.status / 100 == 1 || head.status == 204 || head.status == 304;
        let chunked = lookup("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        let (body, consumed) = if no_body {
            (Vec::new(), head.len)
        } else if chunked {
            match decode_chunked(rest) {
                Ok(Some((body, used))) => (body, head.len + used),
                Ok(None) => return Decoded::Incomplete,
                Err(reason) => return Decoded::Invalid(reason),
            }
        } else if let Some(length) = lookup("content-length") {
            let length = match length.parse::<usize>() {
                Ok(length) if length <= MAX_FRAME_LEN => length,
                _ => return Decoded::invalid(format!("bad Content-Length {:?}", length)),
            };
            if rest.len() < length {
                return Decoded::Incomplete;
            }
            (rest[..length].to_vec(), head.len + length)
        } else if at_eof {
            (rest.to_vec(), buf.len())
        } else {
            return Decoded::Incomplete;
        };

        Decoded::complete(
            HttpResponse {
                status: head.status,
                reason: head.reason,
                headers: head.headers,
                body,
            },
            consumed,
        )
    }
}

impl FrameDecoder for HttpResponseDecoder {
    type Frame = HttpResponse;

    fn decode(&self, buf: &[u8]) -> Decoded<HttpResponse> {
        self.decode_inner(buf, false)
    }

    fn decode_eof(&self, buf: &[u8]) -> Decoded<HttpResponse> {
        match self.decode_inner(buf, true) {
            Decoded::Incomplete => Decoded::invalid(format!(
                "connection closed after {} bytes of an incomplete HTTP response",
                buf.len()
            )),
            other => other,
        }
    }

    fn stage(&self) -> &'static str {
        "awaiting HTTP response"
    }
}

/// Send `request` and read one response
pub async fn exchange(conn: &mut Connection, request: &HttpRequest) -> Result<HttpResponse> {
    conn.exchange(&request.encode(), &HttpResponseDecoder).await
}
