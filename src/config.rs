//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

use crate::relay::LinkOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Independent time budgets for each stage of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub ack: Duration,
    /// Budget for a round trip over the context bridge.
    pub bridge: Duration,
    /// How long a caller waits for a handoff result.
    pub handoff: Duration,
    pub handoff_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(10_000),
            ack: Duration::from_millis(5_000),
            bridge: Duration::from_millis(30_000),
            handoff: Duration::from_millis(30_000),
            handoff_poll: Duration::from_millis(500),
        }
    }
}

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory of the shared key/value store.
    pub store_root: PathBuf,
    pub timeouts: Timeouts,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Check the Schnorr signature of every event before it leaves.
    pub verify_sig: bool,
    /// Accept `ws://` relay URLs. Only meant for local testing.
    pub allow_insecure_relays: bool,
    /// Hex secret key used by the local signer.
    pub secret_key: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self, ConfigError> {
        dotenvy::from_filename(path)?;
        let store_root = env::var("STORE_ROOT")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("STORE_ROOT"))?;
        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            connect: millis("CONNECT_TIMEOUT_MS", defaults.connect)?,
            ack: millis("ACK_TIMEOUT_MS", defaults.ack)?,
            bridge: millis("BRIDGE_TIMEOUT_MS", defaults.bridge)?,
            handoff: millis("HANDOFF_TIMEOUT_MS", defaults.handoff)?,
            handoff_poll: millis("HANDOFF_POLL_MS", defaults.handoff_poll)?,
        };
        let tor_socks = non_empty("TOR_SOCKS");
        let verify_sig = flag("VERIFY_SIG");
        let allow_insecure_relays = flag("ALLOW_INSECURE_RELAYS");
        let secret_key = non_empty("SECRET_KEY");
        Ok(Self {
            store_root,
            timeouts,
            tor_socks,
            verify_sig,
            allow_insecure_relays,
            secret_key,
        })
    }

    /// Options for every relay connection opened from this process.
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            connect_timeout: self.timeouts.connect,
            ack_timeout: self.timeouts.ack,
            socks_proxy: self.tor_socks.clone(),
            allow_insecure: self.allow_insecure_relays,
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn flag(key: &str) -> bool {
    env::var(key).unwrap_or_else(|_| "0".into()) == "1"
}

fn millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match non_empty(key) {
        None => Ok(default),
        Some(value) => u64::from_str(value.trim())
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .ok_or(ConfigError::Invalid { key, value }),
    }
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
