//! Protocol codecs
//!
//! One module per protocol. Each exposes a `DEFAULT_PORT`, one `Probe`
//! implementation per action, and the pure encode/decode functions those
//! handshakes are built from.

pub mod bgp;
pub mod beanstalkd;
pub mod classic;
pub mod cvs;
pub mod ethernetip;
pub mod fins;
pub mod fix;
pub mod fluentd;
pub mod hazelcast;
pub mod iscsi;
pub mod jetdirect;
pub mod kafka;
pub mod kerberos;
pub mod ninep;
pub mod openflow;
pub mod pptp;
pub mod rabbitmq;
pub mod rlogin;
pub mod sane;
pub mod sip;
pub mod socks5;
pub mod ssh;
pub mod ventrilo;
pub mod vnc;
pub mod winrm;
pub mod zmtp;

use regex::Regex;
use std::sync::OnceLock;
use wireprobe_core::{ProbeLimits, ProbeTarget, RawRequest, Result};

/// Compile a fixed pattern once
pub(crate) fn pattern(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("fixed pattern compiles"))
}

/// Target for protocols with no request fields beyond host/port/timeout
pub(crate) fn plain_target(raw: &RawRequest, default_port: u16, limits: &ProbeLimits) -> Result<ProbeTarget> {
    raw.target(Some(default_port), None, limits)
}

/// Target whose default port depends on the `tls` flag
pub(crate) fn tls_target(
    raw: &RawRequest,
    plain_port: u16,
    tls_port: u16,
    limits: &ProbeLimits,
) -> Result<ProbeTarget> {
    let tls = raw.bool_field("tls")?.unwrap_or(false);
    let default_port = if tls { tls_port } else { plain_port };
    Ok(raw.target(Some(default_port), None, limits)?.with_tls(tls))
}
