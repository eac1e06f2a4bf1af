//! Protocol registry - the closed set of probes the service exposes
//!
//! Each protocol key maps to a fixed list of actions, and each action to one
//! `Probe` implementation run through the shared driver.

use serde::Serialize;
use wireprobe_core::{Envelope, Error, RawRequest};

use crate::driver::{run_probe, ProbeContext};
use crate::protocols::{
    beanstalkd, bgp, classic, cvs, ethernetip, fins, fix, fluentd, hazelcast, iscsi, jetdirect, kafka,
    kerberos, ninep, openflow, pptp, rabbitmq, rlogin, sane, sip, socks5, ssh, ventrilo, vnc, winrm,
    zmtp,
};

/// Action names that would open an interactive session
pub const INTERACTIVE_ACTIONS: &[&str] = &[
    "execute", "exec", "shell", "upload", "download", "consume", "publish",
];

/// Supported protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Bgp,
    Kafka,
    Zmtp,
    Rabbitmq,
    Beanstalkd,
    Fluentd,
    Hazelcast,
    Ssh,
    Vnc,
    Rlogin,
    Winrm,
    Pptp,
    Ethernetip,
    Fins,
    Iscsi,
    #[serde(rename = "9p")]
    NineP,
    Cvs,
    Socks5,
    Fix,
    Sip,
    Openflow,
    Kerberos,
    Jetdirect,
    Sane,
    Ventrilo,
    Echo,
    Discard,
    Daytime,
    Chargen,
    Time,
    Finger,
}

impl Protocol {
    pub const ALL: [Protocol; 31] = [
        Protocol::Bgp,
        Protocol::Kafka,
        Protocol::Zmtp,
        Protocol::Rabbitmq,
        Protocol::Beanstalkd,
        Protocol::Fluentd,
        Protocol::Hazelcast,
        Protocol::Ssh,
        Protocol::Vnc,
        Protocol::Rlogin,
        Protocol::Winrm,
        Protocol::Pptp,
        Protocol::Ethernetip,
        Protocol::Fins,
        Protocol::Iscsi,
        Protocol::NineP,
        Protocol::Cvs,
        Protocol::Socks5,
        Protocol::Fix,
        Protocol::Sip,
        Protocol::Openflow,
        Protocol::Kerberos,
        Protocol::Jetdirect,
        Protocol::Sane,
        Protocol::Ventrilo,
        Protocol::Echo,
        Protocol::Discard,
        Protocol::Daytime,
        Protocol::Chargen,
        Protocol::Time,
        Protocol::Finger,
    ];

    /// URL key
    pub fn key(&self) -> &'static str {
        match self {
            Protocol::Bgp => "bgp",
            Protocol::Kafka => "kafka",
            Protocol::Zmtp => "zmtp",
            Protocol::Rabbitmq => "rabbitmq",
            Protocol::Beanstalkd => "beanstalkd",
            Protocol::Fluentd => "fluentd",
            Protocol::Hazelcast => "hazelcast",
            Protocol::Ssh => "ssh",
            Protocol::Vnc => "vnc",
            Protocol::Rlogin => "rlogin",
            Protocol::Winrm => "winrm",
            Protocol::Pptp => "pptp",
            Protocol::Ethernetip => "ethernetip",
            Protocol::Fins => "fins",
            Protocol::Iscsi => "iscsi",
            Protocol::NineP => "9p",
            Protocol::Cvs => "cvs",
            Protocol::Socks5 => "socks5",
            Protocol::Fix => "fix",
            Protocol::Sip => "sip",
            Protocol::Openflow => "openflow",
            Protocol::Kerberos => "kerberos",
            Protocol::Jetdirect => "jetdirect",
            Protocol::Sane => "sane",
            Protocol::Ventrilo => "ventrilo",
            Protocol::Echo => "echo",
            Protocol::Discard => "discard",
            Protocol::Daytime => "daytime",
            Protocol::Chargen => "chargen",
            Protocol::Time => "time",
            Protocol::Finger => "finger",
        }
    }

    /// Resolve a URL key, case-insensitively, including a few common aliases
    pub fn from_key(key: &str) -> Option<Protocol> {
        let key = key.to_ascii_lowercase();
        let alias = match key.as_str() {
            "ninep" | "plan9" => "9p",
            "enip" | "ethernet-ip" => "ethernetip",
            "socks" => "socks5",
            "krb5" => "kerberos",
            "amqp" => "rabbitmq",
            "pjl" => "jetdirect",
            "zeromq" => "zmtp",
            other => other,
        };
        Protocol::ALL.iter().copied().find(|p| p.key() == alias)
    }

    /// Port used when the request omits one; `None` means the port is required
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Protocol::Bgp => Some(bgp::DEFAULT_PORT),
            Protocol::Kafka => Some(kafka::DEFAULT_PORT),
            Protocol::Zmtp => Some(zmtp::DEFAULT_PORT),
            Protocol::Rabbitmq => Some(rabbitmq::DEFAULT_PORT),
            Protocol::Beanstalkd => Some(beanstalkd::DEFAULT_PORT),
            Protocol::Fluentd => Some(fluentd::DEFAULT_PORT),
            Protocol::Hazelcast => Some(hazelcast::DEFAULT_PORT),
            Protocol::Ssh => Some(ssh::DEFAULT_PORT),
            Protocol::Vnc => Some(vnc::DEFAULT_PORT),
            Protocol::Rlogin => Some(rlogin::DEFAULT_PORT),
            Protocol::Winrm => Some(winrm::DEFAULT_PORT),
            Protocol::Pptp => Some(pptp::DEFAULT_PORT),
            Protocol::Ethernetip => Some(ethernetip::DEFAULT_PORT),
            Protocol::Fins => Some(fins::DEFAULT_PORT),
            Protocol::Iscsi => Some(iscsi::DEFAULT_PORT),
            Protocol::NineP => Some(ninep::DEFAULT_PORT),
            Protocol::Cvs => Some(cvs::DEFAULT_PORT),
            Protocol::Socks5 | Protocol::Fix => None,
            Protocol::Sip => Some(sip::DEFAULT_PORT),
            Protocol::Openflow => Some(openflow::DEFAULT_PORT),
            Protocol::Kerberos => Some(kerberos::DEFAULT_PORT),
            Protocol::Jetdirect => Some(jetdirect::DEFAULT_PORT),
            Protocol::Sane => Some(sane::DEFAULT_PORT),
            Protocol::Ventrilo => Some(ventrilo::DEFAULT_PORT),
            Protocol::Echo => Some(classic::ECHO_PORT),
            Protocol::Discard => Some(classic::DISCARD_PORT),
            Protocol::Daytime => Some(classic::DAYTIME_PORT),
            Protocol::Chargen => Some(classic::CHARGEN_PORT),
            Protocol::Time => Some(classic::TIME_PORT),
            Protocol::Finger => Some(classic::FINGER_PORT),
        }
    }

    /// Implemented actions
    pub fn actions(&self) -> &'static [&'static str] {
        match self {
            Protocol::Bgp => &["connect"],
            Protocol::Kafka => &["versions", "metadata"],
            Protocol::Zmtp => &["probe", "handshake"],
            Protocol::Rabbitmq => &["probe", "api"],
            Protocol::Beanstalkd => &["stats", "list-tubes"],
            Protocol::Fluentd => &["send"],
            Protocol::Hazelcast => &["probe"],
            Protocol::Ssh => &["banner", "kexinit"],
            Protocol::Vnc => &["connect"],
            Protocol::Rlogin => &["connect"],
            Protocol::Winrm => &["identify"],
            Protocol::Pptp => &["connect"],
            Protocol::Ethernetip => &["identity"],
            Protocol::Fins => &["connect"],
            Protocol::Iscsi => &["discover"],
            Protocol::NineP => &["version", "attach"],
            Protocol::Cvs => &["login"],
            Protocol::Socks5 => &["connect"],
            Protocol::Fix => &["logon"],
            Protocol::Sip => &["options"],
            Protocol::Openflow => &["hello"],
            Protocol::Kerberos => &["probe"],
            Protocol::Jetdirect => &["info"],
            Protocol::Sane => &["init"],
            Protocol::Ventrilo => &["connect"],
            Protocol::Echo | Protocol::Discard => &["test"],
            Protocol::Daytime | Protocol::Time | Protocol::Finger => &["query"],
            Protocol::Chargen => &["sample"],
        }
    }

    /// Whether the action may be invoked with GET and query parameters
    ///
    /// Actions that carry credentials or write data are POST-only.
    pub fn allows_get(&self, action: &str) -> bool {
        self.actions().contains(&action)
            && !matches!(
                (self, action),
                (Protocol::Fluentd, "send")
                    | (Protocol::Rabbitmq, "api")
                    | (Protocol::Cvs, "login")
                    | (Protocol::Socks5, "connect")
                    | (Protocol::Discard, "test")
            )
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Run `action` of `protocol`; unknown actions are 404, interactive ones 501
pub async fn dispatch(protocol: Protocol, action: &str, raw: &RawRequest, ctx: &ProbeContext) -> Envelope {
    let action = action.to_ascii_lowercase();
    match (protocol, action.as_str()) {
        (Protocol::Bgp, "connect") => run_probe(&bgp::BgpConnect, raw, ctx).await,
        (Protocol::Kafka, "versions") => run_probe(&kafka::KafkaVersions, raw, ctx).await,
        (Protocol::Kafka, "metadata") => run_probe(&kafka::KafkaMetadata, raw, ctx).await,
        (Protocol::Zmtp, "probe") => run_probe(&zmtp::ZmtpProbe, raw, ctx).await,
        (Protocol::Zmtp, "handshake") => run_probe(&zmtp::ZmtpHandshake, raw, ctx).await,
        (Protocol::Rabbitmq, "probe") => run_probe(&rabbitmq::RabbitProbe, raw, ctx).await,
        (Protocol::Rabbitmq, "api") => run_probe(&rabbitmq::RabbitApi, raw, ctx).await,
        (Protocol::Beanstalkd, "stats") => run_probe(&beanstalkd::BeanstalkdStats, raw, ctx).await,
        (Protocol::Beanstalkd, "list-tubes") => run_probe(&beanstalkd::BeanstalkdTubes, raw, ctx).await,
        (Protocol::Fluentd, "send") => run_probe(&fluentd::FluentdSend, raw, ctx).await,
        (Protocol::Hazelcast, "probe") => run_probe(&hazelcast::HazelcastProbe, raw, ctx).await,
        (Protocol::Ssh, "banner") => run_probe(&ssh::SshBanner, raw, ctx).await,
        (Protocol::Ssh, "kexinit") => run_probe(&ssh::SshKexInit, raw, ctx).await,
        (Protocol::Vnc, "connect") => run_probe(&vnc::VncConnect, raw, ctx).await,
        (Protocol::Rlogin, "connect") => run_probe(&rlogin::RloginConnect, raw, ctx).await,
        (Protocol::Winrm, "identify") => run_probe(&winrm::WinrmIdentify, raw, ctx).await,
        (Protocol::Pptp, "connect") => run_probe(&pptp::PptpConnect, raw, ctx).await,
        (Protocol::Ethernetip, "identity") => run_probe(&ethernetip::EnipIdentity, raw, ctx).await,
        (Protocol::Fins, "connect") => run_probe(&fins::FinsConnect, raw, ctx).await,
        (Protocol::Iscsi, "discover") => run_probe(&iscsi::IscsiDiscover, raw, ctx).await,
        (Protocol::NineP, "version") => run_probe(&ninep::NinepVersion, raw, ctx).await,
        (Protocol::NineP, "attach") => run_probe(&ninep::NinepAttach, raw, ctx).await,
        (Protocol::Cvs, "login") => run_probe(&cvs::CvsLogin, raw, ctx).await,
        (Protocol::Socks5, "connect") => run_probe(&socks5::Socks5Connect, raw, ctx).await,
        (Protocol::Fix, "logon") => run_probe(&fix::FixLogon, raw, ctx).await,
        (Protocol::Sip, "options") => run_probe(&sip::SipOptions, raw, ctx).await,
        (Protocol::Openflow, "hello") => run_probe(&openflow::OpenFlowHello, raw, ctx).await,
        (Protocol::Kerberos, "probe") => run_probe(&kerberos::KerberosProbe, raw, ctx).await,
        (Protocol::Jetdirect, "info") => run_probe(&jetdirect::JetDirectInfo, raw, ctx).await,
        (Protocol::Sane, "init") => run_probe(&sane::SaneInit, raw, ctx).await,
        (Protocol::Ventrilo, "connect") => run_probe(&ventrilo::VentriloConnect, raw, ctx).await,
        (Protocol::Echo, "test") => run_probe(&classic::EchoTest, raw, ctx).await,
        (Protocol::Discard, "test") => run_probe(&classic::DiscardTest, raw, ctx).await,
        (Protocol::Daytime, "query") => run_probe(&classic::DaytimeQuery, raw, ctx).await,
        (Protocol::Chargen, "sample") => run_probe(&classic::ChargenSample, raw, ctx).await,
        (Protocol::Time, "query") => run_probe(&classic::TimeQuery, raw, ctx).await,
        (Protocol::Finger, "query") => run_probe(&classic::FingerQuery, raw, ctx).await,
        (_, other) if INTERACTIVE_ACTIONS.contains(&other) => Envelope::from_error(&Error::NotImplemented(format!(
            "The {} action of {} would open an interactive session; only connection probing is supported",
            other, protocol
        ))),
        (_, other) => Envelope::with_status(
            format!(
                "Unknown action '{}' for {}. Available actions: {}",
                other,
                protocol,
                protocol.actions().join(", ")
            ),
            404,
        ),
    }
}
