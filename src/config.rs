//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::{connection::ConnectOptions, registry::RegistryOptions};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the persisted relay list and identity.
    pub state_root: PathBuf,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Enable Schnorr signature verification on ingest.
    pub verify_sig: bool,
    /// Hex secret key overriding the persisted identity.
    pub secret_key: Option<String>,
    /// Bound on establishing one relay connection.
    pub connect_timeout: Duration,
    /// Bound on each relay's answer to a profile lookup.
    pub metadata_timeout: Duration,
    /// Relays joined when nothing is persisted yet.
    pub bootstrap_relays: Vec<String>,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let state_root = PathBuf::from(env::var("STATE_ROOT").context("STATE_ROOT is not set")?);
        let tor_socks = non_empty("TOR_SOCKS");
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "0".into()) == "1";
        let secret_key = non_empty("SECRET_KEY");
        let connect_timeout = Duration::from_secs(secs("CONNECT_TIMEOUT_SECS", 10));
        let metadata_timeout = Duration::from_secs(secs("METADATA_TIMEOUT_SECS", 5));
        let bootstrap_relays = csv_strings(env::var("BOOTSTRAP_RELAYS").unwrap_or_default());
        let log_level = non_empty("LOG_LEVEL").unwrap_or_else(|| "info".into());
        Ok(Self {
            state_root,
            tor_socks,
            verify_sig,
            secret_key,
            connect_timeout,
            metadata_timeout,
            bootstrap_relays,
            log_level,
        })
    }

    /// Options for a registry persisting under `state_root`.
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            connect: ConnectOptions {
                tor_socks: self.tor_socks.clone(),
                connect_timeout: self.connect_timeout,
            },
            state_root: Some(self.state_root.clone()),
            verify_sig: self.verify_sig,
            metadata_timeout: self.metadata_timeout,
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Whole seconds from `key`, falling back to `default` when absent or invalid.
fn secs(key: &str, default: u64) -> u64 {
    non_empty(key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Serialises tests that mutate the process environment.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
