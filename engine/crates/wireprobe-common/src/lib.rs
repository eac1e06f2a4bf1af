//! Wireprobe Common - Shared utilities: configuration, logging, protected hosts
//!
//! This crate provides common functionality used across all wireprobe crates.

pub mod config;
pub mod logging;
pub mod protected;

pub use config::{Config, ConfigBuilder};
pub use logging::{init_logging_with_config, LogConfig};
pub use protected::{IpNetwork, ProtectedHosts};
