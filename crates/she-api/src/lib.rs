//! HTTPS-only client for the SmartHomeEntry control plane API.

pub mod client;
pub mod types;

pub use client::{ApiError, Client};
pub use types::{AgentConfig, HeartbeatMetrics, HeartbeatResponse};
