//! Trust-on-first-use persistence of relay host keys.
//!
//! The store file is re-read on every handshake so operator edits (for
//! example after a legitimate relay key rotation) take effect without a
//! restart. Writes are append-only; the file is only ever extended when a
//! previously unseen host is trusted.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use russh::keys::{HashAlg, PublicKey};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum KnownHostsError {
    /// The host is recorded but presented a different key. Hard failure for
    /// the cycle; the message tells the operator how to reset trust.
    #[error(
        "HOST KEY MISMATCH for {host}: possible MITM attack! \
         Remove {path} to reset trust if the relay key legitimately changed"
    )]
    Mismatch { host: String, path: PathBuf },

    #[error("known_hosts {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encode host key: {0}")]
    Encode(#[from] russh::keys::ssh_key::Error),
}

/// On-disk TOFU store of `(normalised host pattern, public key)` entries in
/// OpenSSH known_hosts format. File mode 0600, directory mode 0750.
#[derive(Debug, Clone)]
pub struct KnownHostsStore {
    path: PathBuf,
}

impl KnownHostsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts or rejects the key presented by `host:port`.
    ///
    ///   - host not recorded: accept, append to the store, log the fingerprint
    ///   - host recorded with the same key: accept
    ///   - host recorded with a different key: [`KnownHostsError::Mismatch`]
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), KnownHostsError> {
        self.ensure_file()?;
        let pattern = normalize(host, port);

        let content = fs::read_to_string(&self.path).map_err(|source| KnownHostsError::Io {
            path: self.path.clone(),
            source,
        })?;

        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((hosts, key_part)) = line.split_once(char::is_whitespace) else {
                warn!(path = %self.path.display(), line = idx + 1, "skipping malformed known_hosts entry");
                continue;
            };
            if !hosts.split(',').any(|h| h == pattern) {
                continue;
            }
            let recorded = match PublicKey::from_openssh(key_part.trim()) {
                Ok(k) => k,
                Err(e) => {
                    warn!(path = %self.path.display(), line = idx + 1, "unparseable known_hosts key: {e}");
                    continue;
                }
            };
            if recorded.key_data() == key.key_data() {
                return Ok(());
            }
            return Err(KnownHostsError::Mismatch {
                host: pattern,
                path: self.path.clone(),
            });
        }

        // First contact with this host: trust and persist.
        self.append(&pattern, key)?;
        info!(
            host = %pattern,
            key_type = %key.algorithm(),
            fingerprint = %key.fingerprint(HashAlg::Sha256),
            "trusting new relay host key (first use)"
        );
        Ok(())
    }

    fn append(&self, pattern: &str, key: &PublicKey) -> Result<(), KnownHostsError> {
        let line = format!("{} {}\n", pattern, key.to_openssh()?);
        let mut file = OpenOptions::new()
            .append(true)
            .mode(0o600)
            .open(&self.path)
            .map_err(|source| KnownHostsError::Io {
                path: self.path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|source| KnownHostsError::Io {
                path: self.path.clone(),
                source,
            })
    }

    fn ensure_file(&self) -> Result<(), KnownHostsError> {
        let io_err = |source| KnownHostsError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent() {
            if !dir.exists() {
                DirBuilder::new()
                    .recursive(true)
                    .mode(0o750)
                    .create(dir)
                    .map_err(io_err)?;
            }
        }
        if !self.path.exists() {
            OpenOptions::new()
                .create(true)
                .write(true)
                .mode(0o600)
                .open(&self.path)
                .map_err(io_err)?;
        }
        Ok(())
    }
}

/// OpenSSH host pattern: the bare host for port 22, `[host]:port` otherwise.
fn normalize(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}
