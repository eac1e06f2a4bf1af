//! 9P2000 version negotiation and attach
//!
//! Every message is `size[4] type[1] tag[2]` little-endian, size counting
//! itself. Strings are `len[2]` followed by UTF-8 bytes.

use async_trait::async_trait;
use std::sync::OnceLock;
use tracing::debug;
use wireprobe_core::{validate_pattern, Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::{ByteReader, LengthPrefixed};
use crate::protocols::pattern;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 564;
pub const DEFAULT_MSIZE: u32 = 8192;
pub const VERSIONS: &[&str] = &["9P2000", "9P2000.u", "9P2000.L"];

const HEADER_LEN: usize = 7;
const NOTAG: u16 = 0xFFFF;
const NOFID: u32 = 0xFFFF_FFFF;
const NONUNAME: u32 = 0xFFFF_FFFF;
const ROOT_FID: u32 = 1;

const TVERSION: u8 = 100;
const RVERSION: u8 = 101;
const TATTACH: u8 = 104;
const RATTACH: u8 = 105;
const RERROR: u8 = 107;
const TCLUNK: u8 = 120;
const RLERROR: u8 = 7;

#[derive(Debug, Clone)]
pub struct NinepRequest {
    pub target: ProbeTarget,
    pub msize: u32,
    pub version: String,
    pub uname: String,
    pub aname: String,
}

/// Server's unique file identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qid {
    pub kind: u8,
    pub version: u32,
    pub path: u64,
}

/// A decoded R-message
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Version { msize: u32, version: String },
    Attach(Qid),
    Error(String),
    Other(u8),
}

struct Message {
    body: Vec<u8>,
}

impl Message {
    fn new(kind: u8, tag: u16) -> Self {
        let mut body = vec![0u8; 4];
        body.push(kind);
        body.extend_from_slice(&tag.to_le_bytes());
        Self { body }
    }

    fn u32(mut self, value: u32) -> Self {
        self.body.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn string(mut self, value: &str) -> Self {
        self.body.extend_from_slice(&(value.len() as u16).to_le_bytes());
        self.body.extend_from_slice(value.as_bytes());
        self
    }

    fn finish(mut self) -> Vec<u8> {
        let size = self.body.len() as u32;
        self.body[..4].copy_from_slice(&size.to_le_bytes());
        self.body
    }
}

pub fn encode_version(msize: u32, version: &str) -> Vec<u8> {
    Message::new(TVERSION, NOTAG).u32(msize).string(version).finish()
}

/// Tattach; the numeric uname trailer exists only in the .u and .L dialects
pub fn encode_attach(tag: u16, fid: u32, uname: &str, aname: &str, version: &str) -> Vec<u8> {
    let msg = Message::new(TATTACH, tag).u32(fid).u32(NOFID).string(uname).string(aname);
    if version.ends_with(".u") || version.ends_with(".L") {
        msg.u32(NONUNAME).finish()
    } else {
        msg.finish()
    }
}

pub fn encode_clunk(tag: u16, fid: u32) -> Vec<u8> {
    Message::new(TCLUNK, tag).u32(fid).finish()
}

pub fn message_decoder() -> LengthPrefixed<impl Fn(&[u8]) -> std::result::Result<usize, String>> {
    LengthPrefixed::new(4, |header: &[u8]| {
        let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if size < HEADER_LEN {
            return Err(format!("message size {} is below the 7-byte header", size));
        }
        Ok(size)
    })
}

fn string(r: &mut ByteReader<'_>, field: &str) -> Result<String> {
    let len = r.u16_le(field)? as usize;
    r.text(len, field)
}

pub fn decode_reply(frame: &[u8]) -> Result<Reply> {
    let mut r = ByteReader::new("9P", frame);
    r.skip(4, "size")?;
    let kind = r.u8("type")?;
    r.skip(2, "tag")?;
    Ok(match kind {
        RVERSION => Reply::Version {
            msize: r.u32_le("msize")?,
            version: string(&mut r, "version")?,
        },
        RATTACH => Reply::Attach(Qid {
            kind: r.u8("qid type")?,
            version: r.u32_le("qid version")?,
            path: r.u64_le("qid path")?,
        }),
        RERROR => Reply::Error(string(&mut r, "ename")?),
        RLERROR => Reply::Error(format!("errno {}", r.u32_le("ecode")?)),
        other => Reply::Other(other),
    })
}

fn qid_type_name(kind: u8) -> &'static str {
    match kind {
        k if k & 0x80 != 0 => "directory",
        k if k & 0x40 != 0 => "append-only",
        k if k & 0x20 != 0 => "exclusive",
        k if k & 0x08 != 0 => "auth",
        k if k & 0x02 != 0 => "symlink",
        _ => "file",
    }
}

/// Exchange Tversion/Rversion and return the negotiated msize and version
async fn negotiate(request: &NinepRequest, conn: &mut Connection) -> Result<(u32, String)> {
    let frame = conn
        .exchange(&encode_version(request.msize, &request.version), &message_decoder())
        .await?;
    match decode_reply(&frame)? {
        Reply::Version { version, .. } if version == "unknown" => Err(Error::rejected(
            "9P",
            format!("server does not speak {}", request.version),
        )),
        Reply::Version { msize, version } => Ok((msize, version)),
        Reply::Error(message) => Err(Error::rejected("9P", message)),
        Reply::Other(kind) => Err(Error::protocol(
            "9P",
            format!("expected Rversion, got message type {}", kind),
        )),
        Reply::Attach(_) => Err(Error::protocol("9P", "expected Rversion, got Rattach")),
    }
}

fn validate_request(raw: &RawRequest, limits: &ProbeLimits) -> Result<NinepRequest> {
    static NAME: OnceLock<regex::Regex> = OnceLock::new();

    let target = raw.target(Some(DEFAULT_PORT), None, limits)?;
    let msize = raw
        .ranged_field("msize", 256, 1 << 20)?
        .map(|v| v as u32)
        .unwrap_or(DEFAULT_MSIZE);
    let version = raw.str_field("version")?.unwrap_or_else(|| VERSIONS[0].to_string());
    if !VERSIONS.contains(&version.as_str()) {
        return Err(Error::validation(format!(
            "Invalid version. Must be one of: {}",
            VERSIONS.join(", ")
        )));
    }
    let uname = raw.str_field("uname")?.unwrap_or_else(|| String::from("nobody"));
    let aname = raw.str_field("aname")?.unwrap_or_default();
    let name = pattern(&NAME, r"^[A-Za-z0-9._/-]{0,255}$");
    validate_pattern(&uname, name, "Invalid uname format")?;
    validate_pattern(&aname, name, "Invalid aname format")?;

    Ok(NinepRequest {
        target,
        msize,
        version,
        uname,
        aname,
    })
}

pub struct NinepVersion;

#[async_trait]
impl Probe for NinepVersion {
    type Request = NinepRequest;

    fn name(&self) -> &'static str {
        "9P"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<NinepRequest> {
        validate_request(raw, limits)
    }

    fn target<'a>(&self, request: &'a NinepRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &NinepRequest, conn: &mut Connection) -> Result<Payload> {
        let (msize, version) = negotiate(request, conn).await?;
        Ok(Payload::new().with("msize", msize).with("version", version))
    }
}

pub struct NinepAttach;

#[async_trait]
impl Probe for NinepAttach {
    type Request = NinepRequest;

    fn name(&self) -> &'static str {
        "9P"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<NinepRequest> {
        validate_request(raw, limits)
    }

    fn target<'a>(&self, request: &'a NinepRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &NinepRequest, conn: &mut Connection) -> Result<Payload> {
        let (msize, version) = negotiate(request, conn).await?;
        let attach = encode_attach(1, ROOT_FID, &request.uname, &request.aname, &version);
        let frame = conn.exchange(&attach, &message_decoder()).await?;

        let qid = match decode_reply(&frame)? {
            Reply::Attach(qid) => qid,
            Reply::Error(message) => return Err(Error::rejected("9P", format!("attach refused: {}", message))),
            other => {
                return Err(Error::protocol("9P", format!("expected Rattach, got {:?}", other)));
            }
        };

        if let Err(e) = conn.send(&encode_clunk(2, ROOT_FID)).await {
            debug!("Tclunk not delivered: {}", e);
        }

        Ok(Payload::new()
            .with("msize", msize)
            .with("version", version)
            .with("uname", request.uname.clone())
            .with("aname", request.aname.clone())
            .with(
                "qid",
                serde_json::json!({
                    "type": qid.kind,
                    "typeName": qid_type_name(qid.kind),
                    "version": qid.version,
                    "path": qid.path,
                }),
            ))
    }
}
