//! Establishes the reverse SSH forward and supervises it: keepalive probes,
//! control-plane heartbeats, and proxying of relay-accepted streams to the
//! local home automation server.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle, Msg};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::{Channel, Disconnect};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::known_hosts::{KnownHostsError, KnownHostsStore};

/// The relay-side bind host for the reverse forward. This is a fixed constant
/// and must never become configurable: binding anywhere else would expose the
/// tunnel port to the public internet.
pub const REVERSE_BIND_HOST: &str = "127.0.0.1";

pub const DEFAULT_LOCAL_ADDR: &str = "localhost:8080";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Heartbeat callback invoked every 60 seconds under the tunnel scope.
/// Returning `Ok(false)` closes the tunnel with [`TunnelError::Inactive`];
/// errors are logged and the tunnel stays up.
pub type HeartbeatFn = Arc<
    dyn Fn(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send>>
        + Send
        + Sync,
>;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// The PEM key from the control plane did not parse. Transient: the next
    /// cycle may receive a fresh key.
    #[error("parse private key: {0}")]
    KeyParse(#[source] russh::keys::Error),

    #[error("dial relay {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error(transparent)]
    HostKey(#[from] KnownHostsError),

    #[error("relay rejected public key auth for user {user:?}")]
    AuthRejected { user: String },

    #[error("request reverse forward {addr}: {source}")]
    Forward {
        addr: String,
        #[source]
        source: russh::Error,
    },

    #[error("keepalive: {0}")]
    Keepalive(String),

    #[error("listener accept: {0}")]
    Accept(String),

    /// Sentinel: the control plane signalled `active = false` via heartbeat.
    #[error("agent deactivated by server")]
    Inactive,
}

/// Parameters for one tunnel run, decoupled from the API crate's wire types.
pub struct TunnelConfig {
    /// DNS name or IP of the relay server.
    pub host: String,
    /// SSH daemon port on the relay.
    pub port: u16,
    /// Relay-side port bound (on loopback only) for the reverse forward.
    pub tunnel_port: u16,
    /// Username on the relay.
    pub ssh_user: String,
    /// PEM-encoded private key without passphrase.
    pub private_key: String,
    /// Address of the local home automation server to proxy to.
    pub local_addr: String,
    pub known_hosts: KnownHostsStore,
    pub heartbeat: HeartbeatFn,
}

struct ClientHandler {
    known_hosts: KnownHostsStore,
    host: String,
    port: u16,
    incoming_tx: mpsc::Sender<Channel<Msg>>,
}

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        self.known_hosts
            .verify(&self.host, self.port, server_public_key)?;
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            origin = %format!("{originator_address}:{originator_port}"),
            bound = %format!("{connected_address}:{connected_port}"),
            "reverse connection from relay"
        );
        // A closed receiver means the supervisor is shutting down; dropping
        // the channel closes the stream on the relay side.
        let _ = self.incoming_tx.send(channel).await;
        Ok(())
    }
}

/// Establishes the reverse SSH tunnel and blocks until one of:
///   - the parent scope is cancelled (returns `Ok(())`)
///   - the SSH connection, keepalive, or accept path fails (transient error)
///   - the heartbeat signals `active = false` (returns [`TunnelError::Inactive`])
pub async fn run(cancel: &CancellationToken, cfg: TunnelConfig) -> Result<(), TunnelError> {
    let local_addr = if cfg.local_addr.is_empty() {
        DEFAULT_LOCAL_ADDR.to_string()
    } else {
        cfg.local_addr.clone()
    };

    let key = decode_secret_key(&cfg.private_key, None).map_err(TunnelError::KeyParse)?;

    let client_config = Arc::new(client::Config {
        // Protocol-level keepalive@openssh.com requests, on top of the
        // supervisor's own liveness probe below.
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: 3,
        ..Default::default()
    });

    let (incoming_tx, incoming_rx) = mpsc::channel::<Channel<Msg>>(16);
    let handler = ClientHandler {
        known_hosts: cfg.known_hosts.clone(),
        host: cfg.host.clone(),
        port: cfg.port,
        incoming_tx,
    };

    let relay_addr = format!("{}:{}", cfg.host, cfg.port);
    info!(relay = %relay_addr, user = %cfg.ssh_user, "connecting to relay");

    let mut handle = match timeout(
        CONNECT_TIMEOUT,
        client::connect(client_config, (cfg.host.as_str(), cfg.port), handler),
    )
    .await
    {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            return Err(match e.downcast::<KnownHostsError>() {
                Ok(hk) => TunnelError::HostKey(hk),
                Err(other) => TunnelError::Connect {
                    addr: relay_addr,
                    reason: format!("{other:#}"),
                },
            });
        }
        Err(_) => {
            return Err(TunnelError::Connect {
                addr: relay_addr,
                reason: format!("timed out after {CONNECT_TIMEOUT:?}"),
            });
        }
    };

    let rsa_hash = handle
        .best_supported_rsa_hash()
        .await
        .map_err(|e| TunnelError::Connect {
            addr: relay_addr.clone(),
            reason: format!("negotiate rsa hash: {e}"),
        })?
        .flatten();
    let auth = handle
        .authenticate_publickey(
            cfg.ssh_user.clone(),
            PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
        )
        .await
        .map_err(|e| TunnelError::Connect {
            addr: relay_addr.clone(),
            reason: format!("auth: {e}"),
        })?;
    if !auth.success() {
        return Err(TunnelError::AuthRejected {
            user: cfg.ssh_user.clone(),
        });
    }

    let bind_addr = format!("{}:{}", REVERSE_BIND_HOST, cfg.tunnel_port);
    handle
        .tcpip_forward(REVERSE_BIND_HOST, cfg.tunnel_port as u32)
        .await
        .map_err(|source| TunnelError::Forward {
            addr: bind_addr.clone(),
            source,
        })?;

    info!(relay = %bind_addr, local = %local_addr, "reverse tunnel active");

    // Child scope shared by the three supervision loops; cancelled when this
    // function returns for any reason.
    let scope = cancel.child_token();
    let _scope_guard = scope.clone().drop_guard();

    let handle = Arc::new(Mutex::new(handle));
    let (err_tx, mut err_rx) = mpsc::channel::<TunnelError>(3);

    spawn_keepalive(scope.clone(), Arc::clone(&handle), err_tx.clone());
    spawn_heartbeat(scope.clone(), cfg.heartbeat.clone(), err_tx.clone());
    spawn_accept(scope.clone(), incoming_rx, local_addr, err_tx.clone());

    let outcome = tokio::select! {
        _ = cancel.cancelled() => None,
        err = err_rx.recv() => err,
    };

    {
        let h = handle.lock().await;
        let _ = h
            .disconnect(Disconnect::ByApplication, "shutting down", "en")
            .await;
    }

    match outcome {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

fn spawn_keepalive(
    scope: CancellationToken,
    handle: Arc<Mutex<Handle<ClientHandler>>>,
    err_tx: mpsc::Sender<TunnelError>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(reason) = keepalive_probe(&handle).await {
                        warn!("keepalive failed: {reason}; treating connection as dead");
                        let _ = err_tx.send(TunnelError::Keepalive(reason)).await;
                        return;
                    }
                    debug!("keepalive ok");
                }
            }
        }
    });
}

/// Reply-required liveness round-trip with a bounded wait: open a throwaway
/// session channel and require the relay to answer within the deadline.
async fn keepalive_probe(handle: &Arc<Mutex<Handle<ClientHandler>>>) -> Result<(), String> {
    let h = handle.lock().await;
    if h.is_closed() {
        return Err("session closed".into());
    }
    match timeout(KEEPALIVE_TIMEOUT, h.channel_open_session()).await {
        Ok(Ok(_probe)) => Ok(()),
        Ok(Err(e)) => Err(format!("request failed: {e}")),
        Err(_) => Err(format!("no reply within {KEEPALIVE_TIMEOUT:?}")),
    }
}

fn spawn_heartbeat(scope: CancellationToken, heartbeat: HeartbeatFn, err_tx: mpsc::Sender<TunnelError>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await; // skip the immediate first tick
        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = ticker.tick() => {
                    match (heartbeat)(scope.clone()).await {
                        Err(e) => warn!("heartbeat error: {e:#} (keeping tunnel alive)"),
                        Ok(false) => {
                            info!("control plane deactivated agent, closing tunnel");
                            let _ = err_tx.send(TunnelError::Inactive).await;
                            return;
                        }
                        Ok(true) => debug!("heartbeat ok"),
                    }
                }
            }
        }
    });
}

fn spawn_accept(
    scope: CancellationToken,
    mut incoming_rx: mpsc::Receiver<Channel<Msg>>,
    local_addr: String,
    err_tx: mpsc::Sender<TunnelError>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                next = incoming_rx.recv() => match next {
                    Some(channel) => {
                        let local = local_addr.clone();
                        tokio::spawn(async move { proxy_channel(channel, &local).await });
                    }
                    None => {
                        // The handler (and with it the sender) is dropped when
                        // the SSH connection dies.
                        let _ = err_tx
                            .send(TunnelError::Accept("relay-side listener closed".into()))
                            .await;
                        return;
                    }
                }
            }
        }
    });
}

/// Bidirectionally proxies one relay stream to the local server. Failures
/// here affect only this connection, never the tunnel itself.
async fn proxy_channel(channel: Channel<Msg>, local_addr: &str) {
    let local = match timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(local_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("cannot reach local server at {local_addr}: {e}");
            return;
        }
        Err(_) => {
            warn!("cannot reach local server at {local_addr}: dial timed out");
            return;
        }
    };

    let stream = channel.into_stream();
    let (mut remote_read, mut remote_write) = tokio::io::split(stream);
    let (mut local_read, mut local_write) = local.into_split();

    // Two independent copy flows; the first to finish ends the pair and the
    // remaining halves are torn down on drop.
    tokio::select! {
        r = tokio::io::copy(&mut remote_read, &mut local_write) => {
            if let Err(e) = r {
                debug!("relay to local copy ended: {e}");
            }
        }
        r = tokio::io::copy(&mut local_read, &mut remote_write) => {
            if let Err(e) = r {
                debug!("local to relay copy ended: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn dummy_heartbeat() -> HeartbeatFn {
        Arc::new(|_scope| Box::pin(async { Ok::<bool, anyhow::Error>(true) }))
    }

    // The relay-side bind address must always be loopback, for every port.
    #[test]
    fn reverse_bind_addr_is_loopback() {
        for port in [1u16, 8080, 9000, 65535] {
            let addr = format!("{REVERSE_BIND_HOST}:{port}");
            assert!(addr.starts_with("127.0.0.1:"), "addr {addr}");
            let parsed: SocketAddr = addr.parse().unwrap();
            assert!(parsed.ip().is_loopback());
        }
    }

    #[tokio::test]
    async fn garbage_private_key_is_a_key_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TunnelConfig {
            host: "relay.example.com".into(),
            port: 2222,
            tunnel_port: 9000,
            ssh_user: "agent".into(),
            private_key: "definitely not a PEM key".into(),
            local_addr: String::new(),
            known_hosts: KnownHostsStore::new(dir.path().join("known_hosts")),
            heartbeat: dummy_heartbeat(),
        };

        let err = run(&CancellationToken::new(), cfg).await.unwrap_err();
        assert!(matches!(err, TunnelError::KeyParse(_)));
    }

    #[test]
    fn inactive_is_a_sentinel_with_a_stable_message() {
        assert_eq!(
            TunnelError::Inactive.to_string(),
            "agent deactivated by server"
        );
    }
}
