//! Error types for the probe engine

use thiserror::Error;

/// Result type alias using the probe Error
pub type Result<T> = std::result::Result<T, Error>;

/// Probe error types
#[derive(Error, Debug)]
pub enum Error {
    // === Request Errors ===
    #[error("{0}")]
    Validation(String),

    #[error("Invalid JSON body: {0}")]
    InvalidBody(String),

    // === Safety Gate ===
    #[error("Cannot probe {host}: {reason}")]
    Blocked { host: String, reason: String },

    // === Connection Errors ===
    #[error("Connection refused by {target}:{port}")]
    ConnectionRefused { target: String, port: u16 },

    #[error("DNS resolution failed for: {hostname}")]
    DnsResolutionFailed { hostname: String },

    #[error("Target unreachable: {target}")]
    TargetUnreachable { target: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    // === Timeouts ===
    #[error("Timeout after {elapsed_ms}ms while {stage}")]
    Timeout { stage: String, elapsed_ms: u64 },

    // === Protocol Errors ===
    #[error("{protocol} protocol error: {message}")]
    Protocol {
        protocol: &'static str,
        message: String,
    },

    #[error("{protocol} peer rejected the request: {message}")]
    Rejected {
        protocol: &'static str,
        message: String,
    },

    // === Dispatch ===
    #[error("{0}")]
    NotImplemented(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Configuration(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification of an error, used to pick the HTTP status of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, the network was never touched
    Validation,
    /// Destination vetoed by the safety gate
    Blocked,
    /// DNS failure, refusal, unreachable route
    Connection,
    /// Deadline exceeded
    Timeout,
    /// Peer answered, but not as the expected protocol
    Protocol,
    /// Action intentionally not offered
    NotImplemented,
    /// Failure inside the engine itself
    Internal,
}

impl ErrorKind {
    /// HTTP status code reported for this kind
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Blocked => 403,
            ErrorKind::NotImplemented => 501,
            ErrorKind::Connection
            | ErrorKind::Timeout
            | ErrorKind::Protocol
            | ErrorKind::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Blocked => "blocked",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Error {
    /// Shorthand for a validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Shorthand for a framing/magic/version violation by the peer
    pub fn protocol(protocol: &'static str, message: impl Into<String>) -> Self {
        Error::Protocol {
            protocol,
            message: message.into(),
        }
    }

    /// Shorthand for a well-formed negative answer from the peer
    pub fn rejected(protocol: &'static str, message: impl Into<String>) -> Self {
        Error::Rejected {
            protocol,
            message: message.into(),
        }
    }

    pub fn timeout(stage: impl Into<String>, elapsed_ms: u64) -> Self {
        Error::Timeout {
            stage: stage.into(),
            elapsed_ms,
        }
    }

    /// Map the error onto the failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::InvalidBody(_) => ErrorKind::Validation,
            Error::Blocked { .. } => ErrorKind::Blocked,
            Error::ConnectionRefused { .. }
            | Error::DnsResolutionFailed { .. }
            | Error::TargetUnreachable { .. }
            | Error::Connection(_)
            | Error::Tls(_) => ErrorKind::Connection,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Protocol { .. } | Error::Rejected { .. } => ErrorKind::Protocol,
            Error::NotImplemented(_) => ErrorKind::NotImplemented,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                    ErrorKind::Protocol
                }
                _ => ErrorKind::Connection,
            },
            Error::Configuration(_) | Error::Json(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if the failure happened before any network I/O
    pub fn is_local(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::Blocked)
    }

    /// Get an error code for logging and the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::InvalidBody(_) => "INVALID_BODY",
            Error::Blocked { .. } => "DESTINATION_BLOCKED",
            Error::ConnectionRefused { .. } => "CONNECTION_REFUSED",
            Error::DnsResolutionFailed { .. } => "DNS_FAILED",
            Error::TargetUnreachable { .. } => "TARGET_UNREACHABLE",
            Error::Connection(_) => "CONNECTION_ERROR",
            Error::Tls(_) => "TLS_ERROR",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Protocol { .. } => "PROTOCOL_ERROR",
            Error::Rejected { .. } => "PEER_REJECTED",
            Error::NotImplemented(_) => "NOT_IMPLEMENTED",
            Error::Configuration(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
