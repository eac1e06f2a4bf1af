//! Deadline-bound transport
//!
//! One `Deadline` governs a whole probe: connect, TLS upgrade and every
//! handshake step race the same remaining budget, so a slow early step
//! leaves less time for the later ones. Dropping a `Connection` closes the
//! socket, which is how cancellation releases it.

use bytes::{Buf, BytesMut};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};
use wireprobe_core::{Error, ProbeTarget, Result, Timing};

use crate::framing::{Decoded, Delimited, FixedSize, FrameDecoder, MAX_FRAME_LEN};

/// Upper bound on the graceful shutdown performed by `close`
pub const CLOSE_GRACE: Duration = Duration::from_millis(250);

const READ_CHUNK: usize = 4096;

/// Anything the probe can talk over: TCP, TLS-over-TCP, or an in-memory pipe in tests
pub trait ProbeStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProbeStream for T {}

/// Time budget for one probe, started at the connect attempt
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

/// TLS behaviour for connections that request it
#[derive(Debug, Clone, Copy)]
pub struct TlsOptions {
    /// Complete handshakes with self-signed or mismatched certificates
    pub accept_invalid_certs: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            accept_invalid_certs: true,
        }
    }
}

/// An open transport bound to one probe
pub struct Connection {
    stream: Box<dyn ProbeStream>,
    buffer: BytesMut,
    deadline: Deadline,
    peer: String,
    protocol: &'static str,
    connect_time: Duration,
    awaiting_reply_since: Option<Instant>,
    rtt: Option<Duration>,
    eof: bool,
}

impl Connection {
    /// Dial `target`, upgrading to TLS when requested, within `deadline`
    pub async fn open(target: &ProbeTarget, tls: &TlsOptions, deadline: Deadline) -> Result<Self> {
        let address = target.address();
        let dial_start = Instant::now();
        debug!("Connecting to {}", address);

        let tcp = match timeout(deadline.remaining(), TcpStream::connect(address.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(classify_connect_error(e, target)),
            Err(_) => {
                return Err(Error::timeout(
                    format!("connecting to {}", address),
                    deadline.elapsed_ms(),
                ))
            }
        };
        if let Err(e) = tcp.set_nodelay(true) {
            trace!("Could not disable Nagle on {}: {}", address, e);
        }

        let stream: Box<dyn ProbeStream> = if target.tls {
            Box::new(upgrade_tls(tcp, target, tls, &deadline).await?)
        } else {
            Box::new(tcp)
        };

        let connect_time = dial_start.elapsed();
        debug!("Connected to {} in {:?}", address, connect_time);
        Ok(Self::from_stream(stream, deadline, address, connect_time))
    }

    /// Wrap an already established stream
    pub fn from_stream(
        stream: Box<dyn ProbeStream>,
        deadline: Deadline,
        peer: impl Into<String>,
        connect_time: Duration,
    ) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            deadline,
            peer: peer.into(),
            protocol: "TCP",
            connect_time,
            // Server-speaks-first protocols measure from establishment
            awaiting_reply_since: Some(Instant::now()),
            rtt: None,
            eof: false,
        }
    }

    /// Label protocol errors raised by the transport
    pub fn set_protocol(&mut self, protocol: &'static str) {
        self.protocol = protocol;
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    pub fn timing(&self) -> Timing {
        Timing {
            connect_time: self.connect_time,
            rtt: self.rtt,
        }
    }

    /// Bytes received but not yet consumed by a decoder
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Write all of `bytes`, racing the deadline
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let remaining = self.remaining_or_timeout("sending request")?;
        trace!("{} -> {} bytes", self.peer, bytes.len());

        let stream = &mut self.stream;
        let write = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        match timeout(remaining, write).await {
            Ok(Ok(())) => {
                self.awaiting_reply_since = Some(Instant::now());
                Ok(())
            }
            Ok(Err(e)) => Err(classify_io_error(e, &self.peer)),
            Err(_) => Err(Error::timeout("sending request", self.deadline.elapsed_ms())),
        }
    }

    /// Read until `decoder` yields a complete frame
    pub async fn read_frame<D: FrameDecoder>(&mut self, decoder: &D) -> Result<D::Frame> {
        loop {
            let decoded = if self.eof {
                decoder.decode_eof(&self.buffer)
            } else {
                decoder.decode(&self.buffer)
            };

            match decoded {
                Decoded::Complete { frame, consumed } => {
                    self.buffer.advance(consumed);
                    return Ok(frame);
                }
                Decoded::Invalid(reason) => {
                    if self.eof && self.buffer.is_empty() {
                        return Err(self.closed_error());
                    }
                    return Err(Error::protocol(self.protocol, reason));
                }
                Decoded::Incomplete if self.eof => return Err(self.closed_error()),
                Decoded::Incomplete => {
                    self.fill(decoder.stage()).await?;
                }
            }
        }
    }

    /// Write a request and read the decoded reply
    pub async fn exchange<D: FrameDecoder>(&mut self, request: &[u8], decoder: &D) -> Result<D::Frame> {
        self.send(request).await?;
        self.read_frame(decoder).await
    }

    /// Exactly `n` bytes
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        self.read_frame(&FixedSize(n)).await
    }

    /// Bytes up to (not including) `delimiter`
    pub async fn read_until(&mut self, delimiter: &'static [u8], max_len: usize) -> Result<Vec<u8>> {
        self.read_frame(&Delimited::new(delimiter, max_len)).await
    }

    /// Whatever arrives within `wait` (bounded by the deadline); may be empty
    pub async fn read_available(&mut self, max_len: usize, wait: Duration) -> Result<Vec<u8>> {
        if self.buffer.is_empty() && !self.eof {
            let wait = wait.min(self.deadline.remaining());
            let stream = &mut self.stream;
            let buffer = &mut self.buffer;
            buffer.reserve(READ_CHUNK);
            match timeout(wait, stream.read_buf(buffer)).await {
                Ok(Ok(0)) => self.eof = true,
                Ok(Ok(_)) => self.note_reply(),
                Ok(Err(e)) => return Err(classify_io_error(e, &self.peer)),
                Err(_) => {}
            }
        }
        Ok(self.take(max_len))
    }

    /// Read until the peer closes, `max_len` bytes arrive, or the peer goes
    /// quiet for `idle` after sending something
    ///
    /// Silence before the first byte is bounded only by the deadline and is a timeout.
    pub async fn read_until_idle(&mut self, max_len: usize, idle: Duration) -> Result<Vec<u8>> {
        while !self.eof && self.buffer.len() < max_len {
            if self.buffer.is_empty() {
                self.fill("awaiting response").await?;
                continue;
            }

            let wait = idle.min(self.deadline.remaining());
            if wait.is_zero() {
                break;
            }
            let stream = &mut self.stream;
            let buffer = &mut self.buffer;
            buffer.reserve(READ_CHUNK);
            match timeout(wait, stream.read_buf(buffer)).await {
                Ok(Ok(0)) => self.eof = true,
                Ok(Ok(n)) => trace!("{} <- {} bytes", self.peer, n),
                Ok(Err(e)) => return Err(classify_io_error(e, &self.peer)),
                Err(_) => break,
            }
        }

        if self.buffer.is_empty() {
            return Err(self.closed_error());
        }
        Ok(self.take(max_len))
    }

    /// Everything until the peer closes or `max_len` bytes arrive
    pub async fn read_to_end(&mut self, max_len: usize) -> Result<Vec<u8>> {
        while !self.eof && self.buffer.len() < max_len {
            self.fill("reading until close").await?;
        }
        if self.buffer.is_empty() {
            return Err(self.closed_error());
        }
        Ok(self.take(max_len))
    }

    /// Graceful shutdown, bounded by `CLOSE_GRACE`; the socket is released either way
    pub async fn close(mut self) {
        if timeout(CLOSE_GRACE, self.stream.shutdown()).await.is_err() {
            trace!("Shutdown of {} did not finish within grace period", self.peer);
        }
        debug!("Closed connection to {}", self.peer);
    }

    fn take(&mut self, max_len: usize) -> Vec<u8> {
        let n = self.buffer.len().min(max_len);
        self.buffer.split_to(n).to_vec()
    }

    fn remaining_or_timeout(&self, stage: &str) -> Result<Duration> {
        let remaining = self.deadline.remaining();
        if remaining.is_zero() {
            return Err(Error::timeout(stage, self.deadline.elapsed_ms()));
        }
        Ok(remaining)
    }

    /// One read into the buffer; returns once at least one byte or EOF arrived
    async fn fill(&mut self, stage: &str) -> Result<()> {
        if self.buffer.len() >= MAX_FRAME_LEN {
            return Err(Error::protocol(
                self.protocol,
                format!("response exceeds {} bytes", MAX_FRAME_LEN),
            ));
        }
        let remaining = self.remaining_or_timeout(stage)?;

        let stream = &mut self.stream;
        let buffer = &mut self.buffer;
        buffer.reserve(READ_CHUNK);
        match timeout(remaining, stream.read_buf(buffer)).await {
            Ok(Ok(0)) => {
                trace!("{} closed the connection", self.peer);
                self.eof = true;
                Ok(())
            }
            Ok(Ok(n)) => {
                trace!("{} <- {} bytes", self.peer, n);
                self.note_reply();
                Ok(())
            }
            Ok(Err(e)) => Err(classify_io_error(e, &self.peer)),
            Err(_) => Err(Error::timeout(stage, self.deadline.elapsed_ms())),
        }
    }

    fn note_reply(&mut self) {
        if let Some(since) = self.awaiting_reply_since.take() {
            if self.rtt.is_none() {
                self.rtt = Some(since.elapsed());
            }
        }
    }

    fn closed_error(&self) -> Error {
        if self.buffer.is_empty() {
            Error::Connection(format!(
                "{} closed the connection without responding",
                self.peer
            ))
        } else {
            Error::protocol(
                self.protocol,
                format!(
                    "connection closed after {} bytes of an incomplete response",
                    self.buffer.len()
                ),
            )
        }
    }
}

async fn upgrade_tls(
    tcp: TcpStream,
    target: &ProbeTarget,
    options: &TlsOptions,
    deadline: &Deadline,
) -> Result<tokio_native_tls::TlsStream<TcpStream>> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(options.accept_invalid_certs)
        .danger_accept_invalid_hostnames(options.accept_invalid_certs)
        .build()
        .map_err(|e| Error::Tls(e.to_string()))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    match timeout(deadline.remaining(), connector.connect(&target.host, tcp)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::Tls(e.to_string())),
        Err(_) => Err(Error::timeout("negotiating TLS", deadline.elapsed_ms())),
    }
}

fn classify_connect_error(e: std::io::Error, target: &ProbeTarget) -> Error {
    use std::io::ErrorKind;

    let message = e.to_string();
    match e.kind() {
        ErrorKind::ConnectionRefused => Error::ConnectionRefused {
            target: target.host.clone(),
            port: target.port,
        },
        ErrorKind::TimedOut => Error::timeout(format!("connecting to {}", target.address()), 0),
        _ if message.contains("lookup")
            || message.contains("resolve")
            || message.contains("not known")
            || message.contains("No address") =>
        {
            Error::DnsResolutionFailed {
                hostname: target.host.clone(),
            }
        }
        _ if message.contains("unreachable") => Error::TargetUnreachable {
            target: target.address(),
        },
        _ => Error::Connection(format!("{}: {}", target.address(), message)),
    }
}

fn classify_io_error(e: std::io::Error, peer: &str) -> Error {
    use std::io::ErrorKind;

    match e.kind() {
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            Error::Connection(format!("{} reset the connection", peer))
        }
        ErrorKind::TimedOut => Error::timeout("waiting on socket", 0),
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::LengthPrefixed;
    use tokio::io::duplex;
    use tokio::net::TcpListener;
    use wireprobe_core::ErrorKind;

    fn pipe(budget: Duration) -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = duplex(64 * 1024);
        let conn = Connection::from_stream(
            Box::new(client),
            Deadline::start(budget),
            "pipe",
            Duration::ZERO,
        );
        (conn, server)
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let (mut conn, mut server) = pipe(Duration::from_secs(2));
        tokio::spawn(async move {
            server.write_all(&[0, 0, 0, 4, 1]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            server.write_all(&[2, 3, 4]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let decoder = LengthPrefixed::new(4, |h: &[u8]| {
            Ok(4 + u32::from_be_bytes([h[0], h[1], h[2], h[3]]) as usize)
        });
        let frame = conn.read_frame(&decoder).await.unwrap();
        assert_eq!(frame, vec![0, 0, 0, 4, 1, 2, 3, 4]);
        assert!(conn.timing().rtt.is_some());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_within_deadline() {
        let (mut conn, _server) = pipe(Duration::from_millis(150));
        let started = Instant::now();
        let err = conn.read_exact(4).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_deadline_is_shared_across_steps() {
        let (mut conn, mut server) = pipe(Duration::from_millis(300));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            server.write_all(b"first\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = server.write_all(b"second\n").await;
        });

        assert_eq!(conn.read_until(b"\n", 64).await.unwrap(), b"first");
        let err = conn.read_until(b"\n", 64).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_peer_close_mid_frame_is_protocol_error() {
        let (mut conn, mut server) = pipe(Duration::from_secs(1));
        tokio::spawn(async move {
            server.write_all(b"RFB 003").await.unwrap();
        });
        let err = conn.read_exact(12).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_peer_close_without_data_is_connection_error() {
        let (mut conn, server) = pipe(Duration::from_secs(1));
        drop(server);
        let err = conn.read_exact(12).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_read_until_idle_collects_until_close() {
        let (mut conn, mut server) = pipe(Duration::from_secs(1));
        tokio::spawn(async move {
            server.write_all(b"Monday, ").await.unwrap();
            server.write_all(b"January 1\r\n").await.unwrap();
        });
        let data = conn
            .read_until_idle(1024, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(data, b"Monday, January 1\r\n");
    }

    #[tokio::test]
    async fn test_read_to_end_stops_at_limit() {
        let (mut conn, mut server) = pipe(Duration::from_secs(1));
        tokio::spawn(async move {
            server.write_all(&[b'x'; 100]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        });
        let data = conn.read_to_end(10).await.unwrap();
        assert_eq!(data.len(), 10);
    }

    #[tokio::test]
    async fn test_read_available_may_be_empty() {
        let (mut conn, _server) = pipe(Duration::from_secs(1));
        let data = conn
            .read_available(64, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_open_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = ProbeTarget::new("127.0.0.1", port, Duration::from_secs(1));
        let err = Connection::open(&target, &TlsOptions::default(), Deadline::start(target.timeout))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_open_records_connect_time() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let target = ProbeTarget::new("127.0.0.1", port, Duration::from_secs(1));
        let conn = Connection::open(&target, &TlsOptions::default(), Deadline::start(target.timeout))
            .await
            .unwrap();
        assert!(conn.timing().connect_time < Duration::from_secs(1));
        assert_eq!(conn.peer(), format!("127.0.0.1:{}", port));
        conn.close().await;
    }
}
