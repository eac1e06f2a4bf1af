//! Incremental frame decoding
//!
//! Decoders never assume one read returns a whole frame. They inspect the
//! bytes buffered so far and report whether a frame is complete, still
//! missing bytes, or impossible for the protocol being spoken.

use wireprobe_core::{Error, Result};

/// Largest frame any decoder will buffer
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Outcome of inspecting the receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A full frame, occupying the first `consumed` bytes of the buffer
    Complete { frame: T, consumed: usize },
    /// More bytes are needed
    Incomplete,
    /// The bytes can never form a valid frame
    Invalid(String),
}

impl<T> Decoded<T> {
    pub fn complete(frame: T, consumed: usize) -> Self {
        Decoded::Complete { frame, consumed }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Decoded::Invalid(reason.into())
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decoded<U> {
        match self {
            Decoded::Complete { frame, consumed } => Decoded::Complete {
                frame: f(frame),
                consumed,
            },
            Decoded::Incomplete => Decoded::Incomplete,
            Decoded::Invalid(reason) => Decoded::Invalid(reason),
        }
    }
}

/// Turns buffered bytes into frames
pub trait FrameDecoder {
    type Frame;

    fn decode(&self, buf: &[u8]) -> Decoded<Self::Frame>;

    /// Called once the peer has closed the stream
    fn decode_eof(&self, buf: &[u8]) -> Decoded<Self::Frame> {
        match self.decode(buf) {
            Decoded::Incomplete => Decoded::invalid(format!(
                "connection closed after {} bytes of an incomplete response",
                buf.len()
            )),
            other => other,
        }
    }

    /// What the connection is doing while this decoder waits
    fn stage(&self) -> &'static str {
        "awaiting response"
    }
}

/// Exactly `n` bytes
#[derive(Debug, Clone, Copy)]
pub struct FixedSize(pub usize);

impl FrameDecoder for FixedSize {
    type Frame = Vec<u8>;

    fn decode(&self, buf: &[u8]) -> Decoded<Vec<u8>> {
        if buf.len() >= self.0 {
            Decoded::complete(buf[..self.0].to_vec(), self.0)
        } else {
            Decoded::Incomplete
        }
    }
}

/// Bytes up to a delimiter; the frame excludes the delimiter
#[derive(Debug, Clone, Copy)]
pub struct Delimited {
    pub delimiter: &'static [u8],
    pub max_len: usize,
}

impl Delimited {
    pub const CRLF: Delimited = Delimited {
        delimiter: b"\r\n",
        max_len: 8192,
    };

    pub const LF: Delimited = Delimited {
        delimiter: b"\n",
        max_len: 8192,
    };

    pub fn new(delimiter: &'static [u8], max_len: usize) -> Self {
        Self { delimiter, max_len }
    }
}

impl FrameDecoder for Delimited {
    type Frame = Vec<u8>;

    fn decode(&self, buf: &[u8]) -> Decoded<Vec<u8>> {
        match find(buf, self.delimiter) {
            Some(pos) if pos <= self.max_len => {
                Decoded::complete(buf[..pos].to_vec(), pos + self.delimiter.len())
            }
            Some(_) => Decoded::invalid(format!("line exceeds {} bytes", self.max_len)),
            None if buf.len() > self.max_len + self.delimiter.len() => {
                Decoded::invalid(format!("no line terminator within {} bytes", self.max_len))
            }
            None => Decoded::Incomplete,
        }
    }

    fn stage(&self) -> &'static str {
        "awaiting line"
    }
}

/// A frame whose total size is declared in a fixed-size header
///
/// `total_len` receives the first `header_len` bytes and returns the full
/// frame length (header included) or a reason the header is unacceptable.
pub struct LengthPrefixed<F> {
    header_len: usize,
    max_len: usize,
    total_len: F,
}

impl<F> LengthPrefixed<F>
where
    F: Fn(&[u8]) -> std::result::Result<usize, String>,
{
    pub fn new(header_len: usize, total_len: F) -> Self {
        Self {
            header_len,
            max_len: MAX_FRAME_LEN,
            total_len,
        }
    }

    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }
}

impl<F> FrameDecoder for LengthPrefixed<F>
where
    F: Fn(&[u8]) -> std::result::Result<usize, String>,
{
    type Frame = Vec<u8>;

    fn decode(&self, buf: &[u8]) -> Decoded<Vec<u8>> {
        if buf.len() < self.header_len {
            return Decoded::Incomplete;
        }
        let total = match (self.total_len)(&buf[..self.header_len]) {
            Ok(total) => total,
            Err(reason) => return Decoded::Invalid(reason),
        };
        if total < self.header_len {
            return Decoded::invalid(format!(
                "declared length {} is shorter than the {}-byte header",
                total, self.header_len
            ));
        }
        if total > self.max_len {
            return Decoded::invalid(format!(
                "declared length {} exceeds the {} byte limit",
                total, self.max_len
            ));
        }
        if buf.len() < total {
            return Decoded::Incomplete;
        }
        Decoded::complete(buf[..total].to_vec(), total)
    }

    fn stage(&self) -> &'static str {
        "awaiting framed response"
    }
}

/// Position of `needle` in `haystack`
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Bounds-checked cursor over a received frame
///
/// Every read failure becomes a protocol error naming the field, so codecs
/// can parse with `?` and never index out of range.
pub struct ByteReader<'a> {
    protocol: &'static str,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(protocol: &'static str, buf: &'a [u8]) -> Self {
        Self {
            protocol,
            buf,
            pos: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn bytes(&mut self, n: usize, field: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::protocol(
                self.protocol,
                format!(
                    "truncated {}: needed {} bytes, {} available",
                    field,
                    n,
                    self.remaining()
                ),
            ));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize, field: &str) -> Result<()> {
        self.bytes(n, field).map(|_| ())
    }

    pub fn array<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N, field)?);
        Ok(out)
    }

    pub fn u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.bytes(1, field)?[0])
    }

    pub fn u16_be(&mut self, field: &str) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array(field)?))
    }

    pub fn u16_le(&mut self, field: &str) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array(field)?))
    }

    pub fn u32_be(&mut self, field: &str) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array(field)?))
    }

    pub fn u32_le(&mut self, field: &str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array(field)?))
    }

    pub fn i16_be(&mut self, field: &str) -> Result<i16> {
        Ok(i16::from_be_bytes(self.array(field)?))
    }

    pub fn i32_be(&mut self, field: &str) -> Result<i32> {
        Ok(i32::from_be_bytes(self.array(field)?))
    }

    pub fn i32_le(&mut self, field: &str) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array(field)?))
    }

    pub fn u64_be(&mut self, field: &str) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array(field)?))
    }

    pub fn u64_le(&mut self, field: &str) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array(field)?))
    }

    pub fn i64_le(&mut self, field: &str) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array(field)?))
    }

    /// Lossy UTF-8 text of `n` bytes
    pub fn text(&mut self, n: usize, field: &str) -> Result<String> {
        Ok(String::from_utf8_lossy(self.bytes(n, field)?).into_owned())
    }

    /// Protocol error attributed to this reader's protocol
    pub fn error(&self, message: impl Into<String>) -> Error {
        Error::protocol(self.protocol, message)
    }
}

/// NUL-terminated or NUL-padded text, trimmed
pub fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_size() {
        assert_eq!(FixedSize(4).decode(b"abc"), Decoded::Incomplete);
        assert_eq!(
            FixedSize(4).decode(b"abcdef"),
            Decoded::complete(b"abcd".to_vec(), 4)
        );
    }

    #[test]
    fn test_delimited_waits_for_terminator() {
        let crlf = Delimited::CRLF;
        assert_eq!(crlf.decode(b"OK 12"), Decoded::Incomplete);
        assert_eq!(crlf.decode(b"OK 12\r"), Decoded::Incomplete);
        assert_eq!(
            crlf.decode(b"OK 12\r\nrest"),
            Decoded::complete(b"OK 12".to_vec(), 7)
        );
    }

    #[test]
    fn test_delimited_rejects_runaway_lines() {
        let short = Delimited::new(b"\n", 4);
        assert!(matches!(short.decode(b"abcdefgh"), Decoded::Invalid(_)));
    }

    #[test]
    fn test_length_prefixed_buffers_until_declared_length() {
        let decoder = LengthPrefixed::new(4, |h: &[u8]| {
            Ok(4 + u32::from_be_bytes([h[0], h[1], h[2], h[3]]) as usize)
        });

        assert_eq!(decoder.decode(&[0, 0]), Decoded::Incomplete);
        assert_eq!(decoder.decode(&[0, 0, 0, 3, 1, 2]), Decoded::Incomplete);
        assert_eq!(
            decoder.decode(&[0, 0, 0, 3, 1, 2, 3, 9]),
            Decoded::complete(vec![0, 0, 0, 3, 1, 2, 3], 7)
        );
    }

    #[test]
    fn test_length_prefixed_limits() {
        let decoder = LengthPrefixed::new(2, |h: &[u8]| Ok(u16::from_be_bytes([h[0], h[1]]) as usize))
            .max_len(100);
        assert!(matches!(decoder.decode(&[0, 1]), Decoded::Invalid(_)));
        assert!(matches!(decoder.decode(&[1, 0]), Decoded::Invalid(_)));
    }

    #[test]
    fn test_decode_eof_reports_truncation() {
        assert!(matches!(FixedSize(4).decode_eof(b"ab"), Decoded::Invalid(_)));
    }

    #[test]
    fn test_byte_reader() {
        let data = [0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03, b'h', b'i'];
        let mut r = ByteReader::new("TEST", &data);
        assert_eq!(r.u8("a").unwrap(), 1);
        assert_eq!(r.u16_be("b").unwrap(), 2);
        assert_eq!(r.u32_be("c").unwrap(), 3);
        assert_eq!(r.text(2, "d").unwrap(), "hi");
        let err = r.u8("e").unwrap_err();
        assert!(err.to_string().contains("truncated e"));
    }

    #[test]
    fn test_c_string() {
        assert_eq!(c_string(b"NULL\0\0\0"), "NULL");
        assert_eq!(c_string(b"  padded \0junk"), "padded");
    }
}
