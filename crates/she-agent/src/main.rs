//! SmartHomeEntry agent entry point.
//!
//! Required environment variables:
//!
//!   SMARTHOMEENTRY_API_URL        full HTTPS URL of the control plane
//!   SMARTHOMEENTRY_INSTALL_TOKEN  install token issued by the control plane
//!
//! Optional: SMARTHOMEENTRY_LOCAL_ADDR (default localhost:8080).
//!
//! Logs go to stderr (captured by journald) and, best effort, to
//! /var/log/smarthomeentry.log.

mod agent;
mod backoff;
mod config;
mod lock;
mod metrics;

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::agent::Agent;
use crate::config::{Paths, Settings};

const LOG_FILE: &str = "/var/log/smarthomeentry.log";

#[tokio::main]
async fn main() {
    init_logging();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            error!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    let mut agent = match Agent::new(settings, Paths::default()) {
        Ok(a) => a,
        Err(e) => {
            error!("agent init: {e:#}");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
            let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
            tokio::select! {
                _ = term.recv() => info!("SIGTERM received, shutting down"),
                _ = int.recv() => info!("SIGINT received, shutting down"),
            }
            cancel.cancel();
        });
    }

    let result = agent.run(&cancel).await;
    agent.close();

    match result {
        Ok(()) => info!("SmartHomeEntry agent stopped cleanly"),
        Err(e) => {
            error!("agent error: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Stderr always; the on-disk log file when it can be opened. The file is
/// append-only, mode 0644, shared with the installer's logrotate setup.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,she_agent=debug".parse().unwrap());

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter).with(stderr_layer);

    match OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o644)
        .open(LOG_FILE)
    {
        Ok(file) => {
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                .init();
        }
        Err(e) => {
            registry.init();
            warn!("cannot open log file {LOG_FILE}: {e}; logging to stderr only");
        }
    }
}
