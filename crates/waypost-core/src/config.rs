//! Discovery configuration, loaded from the `[discovery]` table of a TOML file
//! or from a bare TOML document.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DiscoveryError, DiscoveryResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// TTL applied by `register_with_default_ttl`.
    pub ttl_default_seconds: i64,
    /// Interval of the background expiry sweep.
    pub sweep_interval_millis: u64,
    /// Upper bound for `load_services_async` before a timeout is reported.
    pub async_lookup_timeout_millis: u64,
    /// When false, lookups only see this process's own registrations.
    pub backend_enabled: bool,
    /// Refresh watched services on this interval. Unset disables polling.
    pub poll_interval_millis: Option<u64>,
    /// Make forced reads fail instead of degrading to local results when
    /// no backend is configured.
    pub strict_forced_reads: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ttl_default_seconds: 30,
            sweep_interval_millis: 1_000,
            async_lookup_timeout_millis: 5_000,
            backend_enabled: true,
            poll_interval_millis: None,
            strict_forced_reads: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    discovery: Option<DiscoveryConfig>,
}

impl DiscoveryConfig {
    /// Read the `[discovery]` table from a TOML file.
    ///
    /// A file without the table yields the defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&content)?;
        let config = file.discovery.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document whose top-level keys are the config fields.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: DiscoveryConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> DiscoveryResult<()> {
        if self.sweep_interval_millis == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "sweep_interval_millis must be greater than zero".to_string(),
            ));
        }
        if self.async_lookup_timeout_millis == 0 {
            return Err(DiscoveryError::InvalidConfig(
                "async_lookup_timeout_millis must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_millis == Some(0) {
            return Err(DiscoveryError::InvalidConfig(
                "poll_interval_millis must be greater than zero when set".to_string(),
            ));
        }
        if self.ttl_default_seconds < 0 {
            return Err(DiscoveryError::InvalidConfig(format!(
                "ttl_default_seconds must not be negative, got {}",
                self.ttl_default_seconds
            )));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_millis)
    }

    pub fn async_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.async_lookup_timeout_millis)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_millis.map(Duration::from_millis)
    }
}
