//! Kerberos 5 AS-REQ probe over TCP (RFC 4120)
//!
//! Sends an AS-REQ without pre-authentication for `principal@realm` and
//! reports what the KDC answers. A KRB-ERROR is a normal, successful
//! outcome: error 25 (pre-authentication required) confirms the principal
//! exists and lists the enctypes the KDC will accept. An AS-REP means the
//! principal does not require pre-authentication at all.
//!
//! Messages are DER; over TCP each is preceded by a 4-byte length.

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::OnceLock;
use wireprobe_core::{validate_pattern, Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::framing::LengthPrefixed;
use crate::protocols::pattern;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 88;
pub const DEFAULT_PRINCIPAL: &str = "krbtgt-probe";

const PVNO: i64 = 5;
const MSG_AS_REQ: i64 = 10;
const MSG_AS_REP: i64 = 11;
const MSG_KRB_ERROR: i64 = 30;
const NT_PRINCIPAL: i64 = 1;
const NT_SRV_INST: i64 = 2;
const PA_ETYPE_INFO: i64 = 11;
const PA_ETYPE_INFO2: i64 = 19;
const KDC_ERR_PREAUTH_REQUIRED: i64 = 25;
const REQUESTED_ETYPES: [i64; 3] = [18, 17, 23];

const TAG_INTEGER: u8 = 0x02;
const TAG_BIT_STRING: u8 = 0x03;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_GENERALIZED_TIME: u8 = 0x18;
const TAG_GENERAL_STRING: u8 = 0x1B;

fn application(n: u8) -> u8 {
    0x60 | n
}

fn context(n: u8) -> u8 {
    0xA0 | n
}

#[derive(Debug, Clone)]
pub struct KerberosRequest {
    pub target: ProbeTarget,
    pub realm: String,
    pub principal: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EtypeInfo {
    pub id: i64,
    pub name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

/// What the KDC said
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KdcReply {
    Error {
        code: i64,
        realm: String,
        server_time: String,
        text: Option<String>,
        etypes: Vec<EtypeInfo>,
    },
    AsRep {
        realm: String,
        etype: Option<i64>,
    },
}

pub fn error_name(code: i64) -> &'static str {
    match code {
        0 => "KDC_ERR_NONE",
        1 => "KDC_ERR_NAME_EXP",
        2 => "KDC_ERR_SERVICE_EXP",
        3 => "KDC_ERR_BAD_PVNO",
        6 => "KDC_ERR_C_PRINCIPAL_UNKNOWN",
        7 => "KDC_ERR_S_PRINCIPAL_UNKNOWN",
        12 => "KDC_ERR_POLICY",
        14 => "KDC_ERR_ETYPE_NOSUPP",
        18 => "KDC_ERR_CLIENT_REVOKED",
        23 => "KDC_ERR_KEY_EXPIRED",
        24 => "KDC_ERR_PREAUTH_FAILED",
        25 => "KDC_ERR_PREAUTH_REQUIRED",
        37 => "KRB_AP_ERR_SKEW",
        41 => "KRB_AP_ERR_MODIFIED",
        52 => "KRB_ERR_RESPONSE_TOO_BIG",
        60 => "KRB_ERR_GENERIC",
        68 => "KDC_ERR_WRONG_REALM",
        _ => "UNKNOWN",
    }
}

pub fn etype_name(id: i64) -> &'static str {
    match id {
        1 => "des-cbc-crc",
        3 => "des-cbc-md5",
        17 => "aes128-cts-hmac-sha1-96",
        18 => "aes256-cts-hmac-sha1-96",
        19 => "aes128-cts-hmac-sha256-128",
        20 => "aes256-cts-hmac-sha384-192",
        23 => "rc4-hmac",
        24 => "rc4-hmac-exp",
        _ => "unknown",
    }
}

// ---- DER encoding ----

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
    out
}

fn integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    tlv(TAG_INTEGER, &bytes[start..])
}

fn general_string(value: &str) -> Vec<u8> {
    tlv(TAG_GENERAL_STRING, value.as_bytes())
}

fn sequence(items: &[Vec<u8>]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, &items.concat())
}

fn principal_name(name_type: i64, components: &[&str]) -> Vec<u8> {
    let names: Vec<Vec<u8>> = components.iter().map(|c| general_string(c)).collect();
    sequence(&[
        tlv(context(0), &integer(name_type)),
        tlv(context(1), &sequence(&names)),
    ])
}

pub fn encode_as_req(realm: &str, principal: &str, nonce: u32) -> Vec<u8> {
    let components: Vec<&str> = principal.split('/').collect();
    // forwardable, renewable, canonicalize, renewable-ok
    let kdc_options = tlv(TAG_BIT_STRING, &[0x00, 0x40, 0x81, 0x00, 0x10]);
    let etypes: Vec<Vec<u8>> = REQUESTED_ETYPES.iter().map(|e| integer(*e)).collect();

    let body = sequence(&[
        tlv(context(0), &kdc_options),
        tlv(context(1), &principal_name(NT_PRINCIPAL, &components)),
        tlv(context(2), &general_string(realm)),
        tlv(context(3), &principal_name(NT_SRV_INST, &["krbtgt", realm])),
        tlv(context(5), &tlv(TAG_GENERALIZED_TIME, b"20370913024805Z")),
        tlv(context(7), &integer(nonce as i64)),
        tlv(context(8), &sequence(&etypes)),
    ]);
    let req = sequence(&[
        tlv(context(1), &integer(PVNO)),
        tlv(context(2), &integer(MSG_AS_REQ)),
        tlv(context(4), &body),
    ]);
    let message = tlv(application(MSG_AS_REQ as u8), &req);

    let mut out = (message.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(&message);
    out
}

// ---- DER decoding ----

struct Der<'a> {
    buf: &'a [u8],
    pos: usize,
}

fn der_error(message: impl Into<String>) -> Error {
    Error::protocol("Kerberos", message)
}

impl<'a> Der<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| der_error("truncated DER element"))?;
        self.pos += 1;
        Ok(b)
    }

    /// Next element as (tag, contents)
    fn next(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.byte()?;
        let first = self.byte()?;
        let len = if first < 0x80 {
            first as usize
        } else {
            let n = (first & 0x7f) as usize;
            if n == 0 || n > 4 {
                return Err(der_error("unsupported DER length encoding"));
            }
            let mut len = 0usize;
            for _ in 0..n {
                len = (len << 8) | self.byte()? as usize;
            }
            len
        };
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| der_error("DER element overruns its container"))?;
        let contents = &self.buf[self.pos..end];
        self.pos = end;
        Ok((tag, contents))
    }

    fn expect_tag(&mut self, tag: u8) -> Result<&'a [u8]> {
        let (found, contents) = self.next()?;
        if found != tag {
            return Err(der_error(format!("expected tag {:#04x}, found {:#04x}", tag, found)));
        }
        Ok(contents)
    }
}

/// Fields of a SEQUENCE keyed by their context tag number
fn context_fields(contents: &[u8]) -> Result<Vec<(u8, &[u8])>> {
    let mut der = Der::new(contents);
    let mut fields = Vec::new();
    while !der.is_empty() {
        let (tag, inner) = der.next()?;
        if tag & 0xE0 == 0xA0 {
            fields.push((tag & 0x1f, inner));
        }
    }
    Ok(fields)
}

fn field<'a>(fields: &[(u8, &'a [u8])], n: u8) -> Option<&'a [u8]> {
    fields.iter().find(|(tag, _)| *tag == n).map(|(_, v)| *v)
}

fn read_integer(explicit: &[u8]) -> Result<i64> {
    let bytes = Der::new(explicit).expect_tag(TAG_INTEGER)?;
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(der_error("INTEGER out of range"));
    }
    let fill = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut buf = [fill; 8];
    buf[8 - bytes.len()..].copy_from_slice(bytes);
    Ok(i64::from_be_bytes(buf))
}

fn read_string(explicit: &[u8]) -> Result<String> {
    let (_, bytes) = Der::new(explicit).next()?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn read_time(explicit: &[u8]) -> Result<String> {
    let raw = String::from_utf8_lossy(Der::new(explicit).expect_tag(TAG_GENERALIZED_TIME)?).into_owned();
    Ok(NaiveDateTime::parse_from_str(&raw, "%Y%m%d%H%M%SZ")
        .map(|t| t.and_utc().to_rfc3339())
        .unwrap_or(raw))
}

fn required<'a>(fields: &[(u8, &'a [u8])], n: u8, name: &str) -> Result<&'a [u8]> {
    field(fields, n).ok_or_else(|| der_error(format!("missing {}", name)))
}

/// ETYPE-INFO / ETYPE-INFO2 entries from the METHOD-DATA in e-data
fn decode_etypes(e_data: &[u8]) -> Result<Vec<EtypeInfo>> {
    let method_data = Der::new(e_data).expect_tag(TAG_SEQUENCE)?;
    let mut entries = Der::new(method_data);
    let mut info2 = Vec::new();
    let mut info = Vec::new();

    while !entries.is_empty() {
        let pa = context_fields(entries.expect_tag(TAG_SEQUENCE)?)?;
        let pa_type = read_integer(required(&pa, 1, "padata-type")?)?;
        if pa_type != PA_ETYPE_INFO2 && pa_type != PA_ETYPE_INFO {
            continue;
        }
        let value = Der::new(required(&pa, 2, "padata-value")?).expect_tag(TAG_OCTET_STRING)?;
        let list = Der::new(value).expect_tag(TAG_SEQUENCE)?;
        let mut items = Der::new(list);
        while !items.is_empty() {
            let entry = context_fields(items.expect_tag(TAG_SEQUENCE)?)?;
            let id = read_integer(required(&entry, 0, "etype")?)?;
            let salt = field(&entry, 1).map(read_string).transpose()?;
            let target = if pa_type == PA_ETYPE_INFO2 { &mut info2 } else { &mut info };
            target.push(EtypeInfo {
                id,
                name: etype_name(id),
                salt,
            });
        }
    }
    Ok(if info2.is_empty() { info } else { info2 })
}

pub fn decode_reply(message: &[u8]) -> Result<KdcReply> {
    let (tag, contents) = Der::new(message).next()?;
    let body = Der::new(contents).expect_tag(TAG_SEQUENCE)?;
    let fields = context_fields(body)?;

    if tag == application(MSG_KRB_ERROR as u8) {
        let msg_type = read_integer(required(&fields, 1, "msg-type")?)?;
        if msg_type != MSG_KRB_ERROR {
            return Err(der_error(format!("KRB-ERROR with msg-type {}", msg_type)));
        }
        let code = read_integer(required(&fields, 6, "error-code")?)?;
        let etypes = match field(&fields, 12) {
            Some(e_data) => {
                let octets = Der::new(e_data).expect_tag(TAG_OCTET_STRING)?;
                // e-data is only METHOD-DATA for pre-authentication errors
                decode_etypes(octets).unwrap_or_default()
            }
            None => Vec::new(),
        };
        Ok(KdcReply::Error {
            code,
            realm: read_string(required(&fields, 9, "realm")?)?,
            server_time: read_time(required(&fields, 4, "stime")?)?,
            text: field(&fields, 11).map(read_string).transpose()?,
            etypes,
        })
    } else if tag == application(MSG_AS_REP as u8) {
        let enc_part = field(&fields, 6)
            .map(|f| Der::new(f).expect_tag(TAG_SEQUENCE).and_then(context_fields))
            .transpose()?;
        let etype = match enc_part.as_deref().and_then(|p| field(p, 0)) {
            Some(e) => Some(read_integer(e)?),
            None => None,
        };
        Ok(KdcReply::AsRep {
            realm: read_string(required(&fields, 3, "crealm")?)?,
            etype,
        })
    } else {
        Err(der_error(format!("unexpected application tag {:#04x}", tag)))
    }
}

pub fn message_decoder() -> LengthPrefixed<impl Fn(&[u8]) -> std::result::Result<usize, String>> {
    LengthPrefixed::new(4, |header: &[u8]| {
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if len & 0x8000_0000 != 0 {
            return Err(String::from("reserved high bit set in record length"));
        }
        Ok(4 + len as usize)
    })
    .max_len(64 * 1024)
}

pub struct KerberosProbe;

#[async_trait]
impl Probe for KerberosProbe {
    type Request = KerberosRequest;

    fn name(&self) -> &'static str {
        "Kerberos"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<KerberosRequest> {
        static REALM: OnceLock<regex::Regex> = OnceLock::new();
        static PRINCIPAL: OnceLock<regex::Regex> = OnceLock::new();

        let target = raw.target(Some(DEFAULT_PORT), None, limits)?;
        let realm = raw
            .str_field("realm")?
            .ok_or_else(|| Error::validation("Missing required parameter: realm"))?;
        validate_pattern(&realm, pattern(&REALM, r"^[A-Za-z0-9.-]{1,255}$"), "Invalid realm format")?;
        let principal = raw
            .str_field("principal")?
            .unwrap_or_else(|| DEFAULT_PRINCIPAL.to_string());
        validate_pattern(
            &principal,
            pattern(&PRINCIPAL, r"^[A-Za-z0-9._-]{1,64}(/[A-Za-z0-9._-]{1,64}){0,2}$"),
            "Invalid principal format",
        )?;
        Ok(KerberosRequest {
            target,
            realm,
            principal,
        })
    }

    fn target<'a>(&self, request: &'a KerberosRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &KerberosRequest, conn: &mut Connection) -> Result<Payload> {
        let nonce: u32 = rand::thread_rng().gen_range(1..i32::MAX as u32);
        let frame = conn
            .exchange(&encode_as_req(&request.realm, &request.principal, nonce), &message_decoder())
            .await?;

        match decode_reply(&frame[4..])? {
            KdcReply::Error {
                code,
                realm,
                server_time,
                text,
                etypes,
            } => {
                let mut payload = Payload::new()
                    .with("msgType", "KRB-ERROR")
                    .with("krbErrorCode", code)
                    .with("errorName", error_name(code))
                    .with("realm", realm)
                    .with("serverTime", server_time)
                    .with("preauthRequired", code == KDC_ERR_PREAUTH_REQUIRED)
                    .with("etypes", serde_json::to_value(&etypes)?)
                    .with("principal", request.principal.clone());
                if let Some(text) = text {
                    payload.insert("eText", text);
                }
                Ok(payload)
            }
            KdcReply::AsRep { realm, etype } => {
                let etypes: Vec<EtypeInfo> = etype
                    .map(|id| EtypeInfo {
                        id,
                        name: etype_name(id),
                        salt: None,
                    })
                    .into_iter()
                    .collect();
                Ok(Payload::new()
                    .with("msgType", "AS-REP")
                    .with("realm", realm)
                    .with("serverTime", Utc::now().to_rfc3339())
                    .with("preauthRequired", false)
                    .with("etypes", serde_json::to_value(&etypes)?)
                    .with("principal", request.principal.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{local, run, serve_once};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn preauth_required(realm: &str) -> Vec<u8> {
        let entry = sequence(&[
            tlv(context(0), &integer(18)),
            tlv(context(1), &general_string("EXAMPLE.COMalice")),
        ]);
        let etype_info2 = sequence(&[entry, sequence(&[tlv(context(0), &integer(23))])]);
        let method_data = sequence(&[
            sequence(&[
                tlv(context(1), &integer(PA_ETYPE_INFO2)),
                tlv(context(2), &tlv(TAG_OCTET_STRING, &etype_info2)),
            ]),
            sequence(&[
                tlv(context(1), &integer(2)),
                tlv(context(2), &tlv(TAG_OCTET_STRING, b"")),
            ]),
        ]);
        let body = sequence(&[
            tlv(context(0), &integer(5)),
            tlv(context(1), &integer(30)),
            tlv(context(4), &tlv(TAG_GENERALIZED_TIME, b"20240102030405Z")),
            tlv(context(5), &integer(123)),
            tlv(context(6), &integer(25)),
            tlv(context(9), &general_string(realm)),
            tlv(context(10), &principal_name(NT_SRV_INST, &["krbtgt", realm])),
            tlv(context(12), &tlv(TAG_OCTET_STRING, &method_data)),
        ]);
        tlv(application(30), &body)
    }

    #[test]
    fn test_integer_encoding_is_minimal() {
        assert_eq!(integer(5), vec![0x02, 0x01, 0x05]);
        assert_eq!(integer(128), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(integer(-1), vec![0x02, 0x01, 0xFF]);
        assert_eq!(read_integer(&integer(0x7FFF_FFFF)).unwrap(), 0x7FFF_FFFF);
        assert_eq!(read_integer(&integer(-129)).unwrap(), -129);
    }

    #[test]
    fn test_long_form_length() {
        let content = vec![0xAB; 300];
        let encoded = tlv(TAG_OCTET_STRING, &content);
        assert_eq!(&encoded[..4], &[0x04, 0x82, 0x01, 0x2C]);
        assert_eq!(Der::new(&encoded).expect_tag(TAG_OCTET_STRING).unwrap().len(), 300);
    }

    #[test]
    fn test_as_req_structure() {
        let request = encode_as_req("EXAMPLE.COM", "alice", 42);
        let len = u32::from_be_bytes([request[0], request[1], request[2], request[3]]) as usize;
        assert_eq!(len, request.len() - 4);
        let (tag, contents) = Der::new(&request[4..]).next().unwrap();
        assert_eq!(tag, 0x6A);
        let fields = context_fields(Der::new(contents).expect_tag(TAG_SEQUENCE).unwrap()).unwrap();
        assert_eq!(read_integer(field(&fields, 1).unwrap()).unwrap(), 5);
        assert_eq!(read_integer(field(&fields, 2).unwrap()).unwrap(), 10);
        let body = context_fields(Der::new(field(&fields, 4).unwrap()).expect_tag(TAG_SEQUENCE).unwrap()).unwrap();
        assert_eq!(read_string(field(&body, 2).unwrap()).unwrap(), "EXAMPLE.COM");
        assert_eq!(read_integer(field(&body, 7).unwrap()).unwrap(), 42);
    }

    #[test]
    fn test_decode_preauth_required() {
        match decode_reply(&preauth_required("EXAMPLE.COM")).unwrap() {
            KdcReply::Error {
                code,
                realm,
                server_time,
                etypes,
                ..
            } => {
                assert_eq!(code, 25);
                assert_eq!(realm, "EXAMPLE.COM");
                assert_eq!(server_time, "2024-01-02T03:04:05+00:00");
                assert_eq!(etypes.len(), 2);
                assert_eq!(etypes[0].name, "aes256-cts-hmac-sha1-96");
                assert_eq!(etypes[0].salt.as_deref(), Some("EXAMPLE.COMalice"));
                assert_eq!(etypes[1].id, 23);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated_der_is_protocol_error() {
        let reply = preauth_required("EXAMPLE.COM");
        assert!(decode_reply(&reply[..reply.len() / 2]).is_err());
    }

    #[test]
    fn test_realm_is_required() {
        let raw = RawRequest::new().with("host", "10.0.0.1");
        assert!(KerberosProbe.validate(&raw, &ProbeLimits::default()).is_err());
    }

    #[tokio::test]
    async fn test_probe_against_fake_kdc() {
        let port = serve_once(|mut socket| async move {
            let mut len = [0u8; 4];
            socket.read_exact(&mut len).await.unwrap();
            let mut request = vec![0u8; u32::from_be_bytes(len) as usize];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(request[0], 0x6A);
            let reply = preauth_required("CORP.LOCAL");
            socket.write_all(&(reply.len() as u32).to_be_bytes()).await.unwrap();
            socket.write_all(&reply).await.unwrap();
        })
        .await;

        let envelope = run(&KerberosProbe, local(port).with("realm", "CORP.LOCAL")).await;
        assert!(envelope.success, "{:?}", envelope.error);
        let json = envelope.to_json();
        assert_eq!(json["msgType"], "KRB-ERROR");
        assert_eq!(json["krbErrorCode"], 25);
        assert_eq!(json["errorName"], "KDC_ERR_PREAUTH_REQUIRED");
        assert_eq!(json["preauthRequired"], true);
        assert_eq!(json["etypes"][1]["name"], "rc4-hmac");
    }
}
