//! Wireprobe Network - Connections, framing and protocol handshakes
//!
//! This crate provides the probing machinery behind the HTTP surface:
//! - Transport (deadline-bound TCP connect, optional TLS, buffered reads)
//! - Framing (incremental decoders for length-prefixed and delimited frames)
//! - Driver (validate, gate, connect, handshake, envelope)
//! - Protocol codecs and the registry that dispatches to them

pub mod driver;
pub mod framing;
pub mod http;
pub mod protocols;
pub mod registry;
pub mod transport;

pub use driver::{run_probe, Probe, ProbeContext};
pub use framing::{ByteReader, Decoded, FrameDecoder};
pub use registry::{dispatch, Protocol};
pub use transport::{Connection, Deadline, TlsOptions};
