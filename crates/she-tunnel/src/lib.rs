//! Reverse SSH tunnel to the SmartHomeEntry relay.
//!
//! SECURITY INVARIANT: the reverse port forward ALWAYS binds to 127.0.0.1 on
//! the relay, never to 0.0.0.0. This prevents public exposure of dynamic
//! ports.

pub mod known_hosts;
pub mod supervisor;

pub use known_hosts::{KnownHostsError, KnownHostsStore};
pub use supervisor::{HeartbeatFn, TunnelConfig, TunnelError};
