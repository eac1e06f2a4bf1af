//! Generic probe driver
//!
//! `run_probe` owns the lifecycle every protocol shares: validate, consult
//! the safety gate, open the connection under one deadline, hand the
//! connection to the protocol's handshake, close, and build the envelope.
//! Protocols only describe their request type and their handshake.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, info, warn, Instrument};
use wireprobe_core::{
    AllowAll, Envelope, Error, HostGate, Payload, ProbeLimits, ProbeTarget, RawRequest, Result,
};

use crate::transport::{Connection, Deadline, TlsOptions, CLOSE_GRACE};

/// Process-wide, read-only state handed to every probe
#[derive(Clone)]
pub struct ProbeContext {
    pub gate: Arc<dyn HostGate>,
    pub limits: ProbeLimits,
    pub tls: TlsOptions,
}

impl ProbeContext {
    pub fn new(gate: Arc<dyn HostGate>, limits: ProbeLimits, tls: TlsOptions) -> Self {
        Self { gate, limits, tls }
    }
}

impl Default for ProbeContext {
    fn default() -> Self {
        Self {
            gate: Arc::new(AllowAll),
            limits: ProbeLimits::default(),
            tls: TlsOptions::default(),
        }
    }
}

impl std::fmt::Debug for ProbeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeContext")
            .field("limits", &self.limits)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// One protocol action
#[async_trait]
pub trait Probe: Send + Sync {
    /// Validated request; codecs only ever see this
    type Request: Send + Sync;

    /// Protocol label used in logs and protocol errors
    fn name(&self) -> &'static str;

    /// Check the raw request without touching the network
    fn validate(&self, raw: &RawRequest, limits: &ProbeLimits) -> Result<Self::Request>;

    /// Where to connect
    fn target<'a>(&self, request: &'a Self::Request) -> &'a ProbeTarget;

    /// Drive the handshake over an open connection
    async fn handshake(&self, request: &Self::Request, conn: &mut Connection) -> Result<Payload>;
}

/// Execute one probe; every outcome, including a panic-free failure, becomes an envelope
pub async fn run_probe<P: Probe>(probe: &P, raw: &RawRequest, ctx: &ProbeContext) -> Envelope {
    let request = match probe.validate(raw, &ctx.limits) {
        Ok(request) => request,
        Err(e) => {
            debug!("{} request rejected: {}", probe.name(), e);
            return Envelope::failure(&e, raw.raw_host(), None);
        }
    };

    let target = probe.target(&request);
    let span = tracing::info_span!(
        "probe",
        protocol = probe.name(),
        host = %target.host,
        port = target.port
    );

    async {
        let decision = ctx.gate.check_host(&target.host).await;
        if decision.blocked {
            let reason = decision
                .reason
                .unwrap_or_else(|| String::from("destination is protected"));
            info!("Blocked probe: {}", reason);
            let error = Error::Blocked {
                host: target.host.clone(),
                reason,
            };
            return Envelope::failure(&error, Some(target.host.clone()), Some(target.port));
        }

        let started = Instant::now();
        let outcome = match timeout(target.timeout + CLOSE_GRACE, attempt(probe, &request, target, ctx)).await {
            Ok(outcome) => outcome,
            // Dropping the attempt future closes the socket
            Err(_) => Err(Error::timeout(
                "completing the handshake",
                started.elapsed().as_millis() as u64,
            )),
        };

        match outcome {
            Ok((payload, timing)) => {
                debug!("Probe succeeded in {:?}", started.elapsed());
                Envelope::success(target, timing, payload)
            }
            Err(e) => {
                warn!("Probe failed after {:?}: {}", started.elapsed(), e);
                Envelope::failure(&e, Some(target.host.clone()), Some(target.port))
            }
        }
    }
    .instrument(span)
    .await
}

async fn attempt<P: Probe>(
    probe: &P,
    request: &P::Request,
    target: &ProbeTarget,
    ctx: &ProbeContext,
) -> Result<(Payload, wireprobe_core::Timing)> {
    let mut conn = Connection::open(target, &ctx.tls, Deadline::start(target.timeout)).await?;
    conn.set_protocol(probe.name());

    let result = probe.handshake(request, &mut conn).await;
    let timing = conn.timing();
    conn.close().await;

    result.map(|payload| (payload, timing))
}
