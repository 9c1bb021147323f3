//! Coordination settings.
//!
//! Every field has a default, so a JSON file only needs the keys it wants to
//! change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::layout::{Geometry, MAX_CAPACITY};
use crate::core::{Error, Result};
use crate::store::{DEFAULT_CAPACITY, DEFAULT_MAX_PAYLOAD};

pub use crate::core::layout::MAX_PAYLOAD_LIMIT;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Name shared by every process of the application. Determines the
    /// default store location.
    pub app_name: String,

    /// Explicit store location. Default: see [`default_store_path`].
    pub store_path: Option<PathBuf>,

    pub store: StoreConfig,
    pub lease: LeaseConfig,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Event slots in a newly created store.
    /// Default: 32
    pub capacity: usize,

    /// Payload bytes per slot in a newly created store.
    /// Default: 512
    pub max_payload: usize,

    /// Pending events older than this expire; settled events are dropped
    /// this long after settling.
    /// Default: 30 s
    pub max_event_age_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Time without a heartbeat after which the owner is presumed gone.
    /// Default: 5 s
    pub duration_ms: u64,

    /// How often the host should call `tick`, renewing the lease.
    /// Default: 1 s
    pub renew_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Upper bound between store checks while waiting on an event.
    /// Default: 100 ms
    pub poll_interval_ms: u64,

    /// How long a handoff waits for the owner before taking over.
    /// Default: 10 s
    pub wait_timeout_ms: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            app_name: "handoff".to_string(),
            store_path: None,
            store: StoreConfig::default(),
            lease: LeaseConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_event_age_ms: 30_000,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_ms: 5_000,
            renew_interval_ms: 1_000,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            wait_timeout_ms: 10_000,
        }
    }
}

impl HandoffConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Reads a JSON config file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&bytes)
            .map_err(|err| Error::InvalidConfig(format!("{}: {err}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() || self.app_name.contains(std::path::is_separator) {
            return Err(Error::InvalidConfig(format!(
                "app_name {:?} must be a non-empty file name",
                self.app_name
            )));
        }
        if self.store.capacity == 0 || self.store.capacity > MAX_CAPACITY {
            return Err(Error::InvalidConfig(format!(
                "store.capacity must be within 1..={MAX_CAPACITY}"
            )));
        }
        if self.store.max_payload == 0 || self.store.max_payload > MAX_PAYLOAD_LIMIT {
            return Err(Error::InvalidConfig(format!(
                "store.max_payload must be within 1..={MAX_PAYLOAD_LIMIT}"
            )));
        }
        if self.lease.renew_interval_ms == 0 || self.lease.renew_interval_ms >= self.lease.duration_ms {
            return Err(Error::InvalidConfig(
                "lease.renew_interval_ms must be positive and shorter than lease.duration_ms".into(),
            ));
        }
        if self.channel.poll_interval_ms == 0
            || self.channel.poll_interval_ms.saturating_mul(4) > self.lease.duration_ms
        {
            return Err(Error::InvalidConfig(
                "channel.poll_interval_ms must be positive and at most a quarter of lease.duration_ms"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| default_store_path(&self.app_name))
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            capacity: self.store.capacity,
            max_payload: self.store.max_payload,
        }
    }
}

impl LeaseConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }
}

impl ChannelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// `$XDG_RUNTIME_DIR/<app>.<uid>.handoff`, or the same name under the
/// system temp dir. The uid keeps users on one machine apart.
pub fn default_store_path(app_name: &str) -> PathBuf {
    let dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .filter(|dir| dir.is_dir())
        .unwrap_or_else(std::env::temp_dir);
    let uid = unsafe { libc::getuid() };
    dir.join(format!("{app_name}.{uid}.handoff"))
}
