//! Wireprobe - multi-protocol connectivity probing service
//!
//! This is the main entry point for the HTTP server binary.

mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use wireprobe_common::logging::{init_logging_with_config, LogConfig};
use wireprobe_common::{Config, ProtectedHosts};
use wireprobe_network::{ProbeContext, TlsOptions};

/// Wireprobe HTTP server
#[derive(Parser, Debug)]
#[command(name = "wireprobe")]
#[command(version)]
#[command(about = "Probe network services over their native protocols", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/wireprobe/wireprobe.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long, env = "WIREPROBE_BIND_ADDR")]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json, compact)
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_found = std::path::Path::new(&args.config).exists();
    let config = if config_found {
        Config::from_file(&args.config)?
    } else {
        Config::default()
    };
    let mut config = config.merge_env();
    config.validate()?;

    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    init_logging_with_config(LogConfig::from_settings(&config.logging));

    info!("Wireprobe starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if !config_found {
        info!("Config file {} not found, using defaults", args.config);
    }

    let gate = ProtectedHosts::from_config(&config.safety)?;
    info!(
        "Protected destinations: {} domains, {} networks",
        config.safety.blocked_domains.len(),
        config.safety.blocked_cidrs.len()
    );

    let ctx = ProbeContext::new(
        Arc::new(gate),
        config.limits(),
        TlsOptions {
            accept_invalid_certs: config.probes.accept_invalid_certs,
        },
    );

    let bind = args.bind.unwrap_or_else(|| config.server.bind_addr.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    info!("Listening on {}", bind);
    info!(
        "Probe timeouts: default {}ms, max {}ms",
        config.probes.default_timeout_ms, config.probes.max_timeout_ms
    );

    axum::serve(listener, routes::router(ctx))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await?;

    Ok(())
}
