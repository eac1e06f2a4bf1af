//! CVS pserver authentication
//!
//! The password travels "scrambled" through a fixed byte substitution, which
//! is an obfuscation and not encryption. The server answers `I LOVE YOU` or
//! `I HATE YOU`, optionally preceded by `E` message lines.

use async_trait::async_trait;
use std::sync::OnceLock;
use wireprobe_core::{validate_pattern, Error, Payload, ProbeLimits, ProbeTarget, RawRequest, Result};

use crate::driver::Probe;
use crate::protocols::pattern;
use crate::transport::Connection;

pub const DEFAULT_PORT: u16 = 2401;

const MAX_LINE: usize = 1024;
const MAX_MESSAGE_LINES: usize = 16;

#[rustfmt::skip]
const SHIFTS: [u8; 256] = [
      0,   1,   2,   3,   4,   5,   6,   7,   8,   9,  10,  11,  12,  13,  14,  15,
     16,  17,  18,  19,  20,  21,  22,  23,  24,  25,  26,  27,  28,  29,  30,  31,
    114, 120,  53,  79,  96, 109,  72, 108,  70,  64,  76,  67, 116,  74,  68,  87,
    111,  52,  75, 119,  49,  34,  82,  81,  95,  65, 112,  86, 118, 110, 122, 105,
     41,  57,  83,  43,  46, 102,  40,  89,  38, 103,  45,  50,  42, 123,  91,  35,
    125,  55,  54,  66, 124, 126,  59,  47,  92,  71, 115,  78,  88, 107, 106,  56,
     36, 121, 117, 104, 101, 100,  69,  73,  99,  63,  94,  93,  39,  37,  61,  48,
     58, 113,  32,  90,  44,  98,  60,  51,  33,  97,  62,  77,  84,  80,  85, 223,
    225, 216, 187, 166, 229, 189, 222, 188, 141, 249, 148, 200, 184, 136, 248, 190,
    199, 170, 181, 204, 138, 232, 218, 183, 255, 234, 220, 247, 213, 203, 226, 193,
    174, 172, 228, 252, 217, 201, 131, 230, 197, 211, 145, 238, 161, 179, 160, 212,
    207, 221, 254, 173, 202, 146, 224, 151, 140, 196, 205, 130, 135, 133, 143, 246,
    192, 159, 244, 239, 185, 168, 215, 144, 139, 165, 180, 157, 147, 186, 214, 176,
    227, 231, 219, 169, 175, 156, 206, 198, 129, 164, 150, 210, 154, 177, 134, 127,
    182, 128, 158, 208, 162, 132, 167, 209, 149, 241, 153, 251, 237, 236, 171, 195,
    243, 233, 253, 240, 194, 250, 191, 155, 142, 137, 245, 235, 163, 242, 178, 152,
];

#[derive(Debug, Clone)]
pub struct CvsRequest {
    pub target: ProbeTarget,
    pub root: String,
    pub username: String,
    pub password: String,
}

/// Scramble a password the way `cvs login` stores it (method `A`)
pub fn scramble(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.push(b'A');
    out.extend(password.bytes().map(|b| SHIFTS[b as usize]));
    out
}

pub fn encode_auth_request(root: &str, username: &str, password: &str) -> Vec<u8> {
    let mut out = b"BEGIN AUTH REQUEST\n".to_vec();
    for line in [root.as_bytes(), username.as_bytes(), &scramble(password)] {
        out.extend_from_slice(line);
        out.push(b'\n');
    }
    out.extend_from_slice(b"END AUTH REQUEST\n");
    out
}

/// Final verdict of an authentication exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub authenticated: bool,
    pub response: String,
    pub messages: Vec<String>,
}

pub struct CvsLogin;

#[async_trait]
impl Probe for CvsLogin {
    type Request = CvsRequest;

    fn name(&self) -> &'static str {
        "CVS"
    }

    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<CvsRequest> {
        static ROOT: OnceLock<regex::Regex> = OnceLock::new();
        static USER: OnceLock<regex::Regex> = OnceLock::new();

        let target = raw.target(Some(DEFAULT_PORT), None, limits)?;
        let root = raw
            .str_field("root")?
            .ok_or_else(|| Error::validation("Missing required field: root"))?;
        let username = raw
            .str_field("username")?
            .ok_or_else(|| Error::validation("Missing required field: username"))?;
        let password = raw.str_field("password")?.unwrap_or_default();

        validate_pattern(
            &root,
            pattern(&ROOT, r"^/[A-Za-z0-9._/-]{0,255}$"),
            "Invalid root (must be an absolute repository path)",
        )?;
        validate_pattern(&username, pattern(&USER, r"^[A-Za-z0-9._-]{1,64}$"), "Invalid username format")?;
        if password.len() > 128 || password.chars().any(|c| c.is_control()) {
            return Err(Error::validation("Invalid password (printable, at most 128 bytes)"));
        }

        Ok(CvsRequest {
            target,
            root,
            username,
            password,
        })
    }

    fn target<'a>(&self, request: &'a CvsRequest) -> &'a ProbeTarget {
        &request.target
    }

    async fn handshake(&self, request: &CvsRequest, conn: &mut Connection) -> Result<Payload> {
        conn.send(&encode_auth_request(&request.root, &request.username, &request.password))
            .await?;

        let mut messages = Vec::new();
        let verdict = loop {
            let raw = conn.read_until(b"\n", MAX_LINE).await?;
            let line = String::from_utf8_lossy(&raw).trim_end().to_string();
            match line.as_str() {
                "I LOVE YOU" => break Verdict { authenticated: true, response: line, messages },
                "I HATE YOU" => break Verdict { authenticated: false, response: line, messages },
                l if l.starts_with("error") => {
                    break Verdict { authenticated: false, response: line, messages }
                }
                l if l.starts_with("E ") || l == "E" => {
                    if messages.len() < MAX_MESSAGE_LINES {
                        messages.push(l[1..].trim().to_string());
                    }
                }
                _ => {
                    return Err(Error::protocol(
                        "CVS",
                        format!("unexpected pserver reply: {}", line.chars().take(80).collect::<String>()),
                    ))
                }
            }
        };

        let mut payload = Payload::new()
            .with("authenticated", verdict.authenticated)
            .with("response", verdict.response)
            .with("root", request.root.clone())
            .with("username", request.username.clone());
        if !verdict.messages.is_empty() {
            payload.insert("messages", verdict.messages);
        }
        Ok(payload)
    }
}
