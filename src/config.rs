//! Runtime configuration.
//!
//! Each subsystem owns a plain config struct with `Default` and
//! `from_env()`; `SyncConfig` gathers them. Unparseable variables fall back
//! to the default with a warning.

use std::str::FromStr;

use tracing::warn;

use crate::network::auth::JoinTokenConfig;
use crate::network::log::SnapshotPolicy;
use crate::network::reconnect::BackoffConfig;
use crate::network::signaling::SignalingConfig;

/// Read `name` and parse it, falling back to `default`.
pub(crate) fn env_or<T>(name: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(var = name, value = %raw, "Ignoring unparseable environment variable");
                default
            }
        },
        Err(_) => default,
    }
}

/// Read a comma-separated list; empty entries are dropped.
pub(crate) fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Full synchronization core configuration.
#[derive(Clone, Debug, Default)]
pub struct SyncConfig {
    /// Reconnection backoff.
    pub backoff: BackoffConfig,
    /// Snapshot cadence.
    pub snapshots: SnapshotPolicy,
    /// Join token endpoint.
    pub join_tokens: JoinTokenConfig,
    /// Signaling transport.
    pub signaling: SignalingConfig,
}

impl SyncConfig {
    /// Load every section from the environment.
    pub fn from_env() -> Self {
        Self {
            backoff: BackoffConfig::from_env(),
            snapshots: SnapshotPolicy::from_env(),
            join_tokens: JoinTokenConfig::from_env(),
            signaling: SignalingConfig::from_env(),
        }
    }
}
