//! Startup configuration from the environment, plus the fixed filesystem
//! collaborators shared by the agent's components.

use std::path::PathBuf;

use anyhow::{bail, Result};

pub const DEFAULT_LOCAL_ADDR: &str = "localhost:8080";

/// Environment configuration read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the control plane (must be HTTPS).
    pub api_url: String,
    /// Install token issued by the control plane.
    pub token: String,
    /// Address of the local home automation server.
    pub local_addr: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_url = match get("SMARTHOMEENTRY_API_URL") {
            Some(v) if !v.is_empty() => v,
            _ => bail!("SMARTHOMEENTRY_API_URL environment variable is required"),
        };
        let token = match get("SMARTHOMEENTRY_INSTALL_TOKEN") {
            Some(v) if !v.is_empty() => v,
            _ => bail!("SMARTHOMEENTRY_INSTALL_TOKEN environment variable is required"),
        };
        let local_addr = get("SMARTHOMEENTRY_LOCAL_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_LOCAL_ADDR.to_string());
        Ok(Self {
            api_url,
            token,
            local_addr,
        })
    }
}

/// Fixed on-disk locations. Injected into the components that need them so
/// tests can point everything at a temp directory.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub key_file: PathBuf,
    pub known_hosts: PathBuf,
    pub lock_file: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            config_dir: "/etc/smarthomeentry".into(),
            key_file: "/etc/smarthomeentry/agent_key".into(),
            known_hosts: "/etc/smarthomeentry/known_hosts".into(),
            lock_file: "/var/run/smarthomeentry-agent.pid".into(),
        }
    }
}

impl Paths {
    #[cfg(test)]
    pub fn in_dir(dir: &std::path::Path) -> Self {
        Self {
            config_dir: dir.to_path_buf(),
            key_file: dir.join("agent_key"),
            known_hosts: dir.join("known_hosts"),
            lock_file: dir.join("agent.pid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn requires_api_url() {
        let err = Settings::from_lookup(lookup(&[("SMARTHOMEENTRY_INSTALL_TOKEN", "t")]))
            .unwrap_err();
        assert!(err.to_string().contains("SMARTHOMEENTRY_API_URL"));
    }

    #[test]
    fn requires_token() {
        let err = Settings::from_lookup(lookup(&[("SMARTHOMEENTRY_API_URL", "https://api.example")]))
            .unwrap_err();
        assert!(err.to_string().contains("SMARTHOMEENTRY_INSTALL_TOKEN"));
    }

    #[test]
    fn local_addr_defaults() {
        let s = Settings::from_lookup(lookup(&[
            ("SMARTHOMEENTRY_API_URL", "https://api.example"),
            ("SMARTHOMEENTRY_INSTALL_TOKEN", "t"),
        ]))
        .unwrap();
        assert_eq!(s.local_addr, DEFAULT_LOCAL_ADDR);
    }

    #[test]
    fn local_addr_override() {
        let s = Settings::from_lookup(lookup(&[
            ("SMARTHOMEENTRY_API_URL", "https://api.example"),
            ("SMARTHOMEENTRY_INSTALL_TOKEN", "t"),
            ("SMARTHOMEENTRY_LOCAL_ADDR", "127.0.0.1:9090"),
        ]))
        .unwrap();
        assert_eq!(s.local_addr, "127.0.0.1:9090");
    }
}
