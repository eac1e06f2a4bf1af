//! Wireprobe Core - Foundation types shared by the probe engine
//!
//! This crate provides the core abstractions used throughout wireprobe:
//! - `Error` / `ErrorKind`: the failure taxonomy and its HTTP mapping
//! - `RawRequest`, `ProbeTarget`: untyped input and the validated destination
//! - `Envelope`, `Payload`: the uniform response contract
//! - `HostGate`: the safety gate consulted before any connection

pub mod envelope;
pub mod error;
pub mod gate;
pub mod request;
pub mod target;

// Re-export commonly used types at crate root
pub use envelope::{Envelope, Payload, Timing};
pub use error::{Error, ErrorKind, Result};
pub use gate::{AllowAll, GateDecision, HostGate};
pub use request::RawRequest;
pub use target::{
    validate_host, validate_pattern, validate_port, validate_timeout, ProbeLimits, ProbeTarget,
};
