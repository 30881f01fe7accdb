//! Unit agent configuration.
//!
//! The binary builds a [`UniterConfig`] from `UNITER_*` environment
//! variables; tests and embedders construct one with [`UniterConfig::new`].

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use uniter_core::{CharmUrl, UnitName};

use crate::error::{Result, UniterError};

/// Configuration for one unit agent.
#[derive(Debug, Clone, Deserialize)]
pub struct UniterConfig {
    /// The unit this agent runs.
    pub unit: UnitName,

    /// Directory holding the persisted operation state.
    #[serde(default = "UniterConfig::default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory the charm is deployed into.
    #[serde(default = "UniterConfig::default_charm_dir")]
    pub charm_dir: PathBuf,

    /// Listen address for the agent's local HTTP API.
    #[serde(default = "UniterConfig::default_listen_addr")]
    pub listen_addr: String,

    /// Base URL of the controller API. Without one the agent runs detached.
    #[serde(default)]
    pub api_url: Option<String>,

    /// Charm the unit runs when there is no controller API to ask.
    #[serde(default)]
    pub charm_url: Option<CharmUrl>,

    /// Whether leadership is tracked for this unit's application.
    #[serde(default = "UniterConfig::default_leadership_enabled")]
    pub leadership_enabled: bool,

    /// Interval between collect-metrics hooks, in seconds.
    #[serde(default = "UniterConfig::default_metrics_poll")]
    pub metrics_poll_interval_seconds: u64,

    /// How long to wait for the leadership tracker to answer a claim.
    #[serde(default = "UniterConfig::default_claim_timeout")]
    pub leadership_claim_timeout_seconds: u64,

    /// Capacity of each queued event stream.
    #[serde(default = "UniterConfig::default_event_capacity")]
    pub event_queue_capacity: usize,
}

impl UniterConfig {
    fn default_data_dir() -> PathBuf {
        PathBuf::from("/var/lib/uniter")
    }

    fn default_charm_dir() -> PathBuf {
        PathBuf::from("/var/lib/uniter/charm")
    }

    fn default_listen_addr() -> String {
        "127.0.0.1:8090".to_string()
    }

    const fn default_leadership_enabled() -> bool {
        true
    }

    const fn default_metrics_poll() -> u64 {
        300 // 5 minutes
    }

    const fn default_claim_timeout() -> u64 {
        30
    }

    const fn default_event_capacity() -> usize {
        64
    }

    /// Configuration for `unit` with every other setting at its default.
    #[must_use]
    pub fn new(unit: UnitName) -> Self {
        Self {
            unit,
            data_dir: Self::default_data_dir(),
            charm_dir: Self::default_charm_dir(),
            listen_addr: Self::default_listen_addr(),
            api_url: None,
            charm_url: None,
            leadership_enabled: Self::default_leadership_enabled(),
            metrics_poll_interval_seconds: Self::default_metrics_poll(),
            leadership_claim_timeout_seconds: Self::default_claim_timeout(),
            event_queue_capacity: Self::default_event_capacity(),
        }
    }

    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::Config` if `UNITER_UNIT` is missing or a
    /// variable cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` to read variables.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::Config` if `UNITER_UNIT` is missing or a
    /// variable cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let unit = lookup("UNITER_UNIT")
            .ok_or_else(|| UniterError::Config("UNITER_UNIT is not set".into()))?
            .parse::<UnitName>()
            .map_err(|e| UniterError::Config(e.to_string()))?;

        let mut config = Self::new(unit);
        if let Some(dir) = lookup("UNITER_DATA_DIR") {
            config.data_dir = dir.into();
        }
        if let Some(dir) = lookup("UNITER_CHARM_DIR") {
            config.charm_dir = dir.into();
        }
        if let Some(addr) = lookup("UNITER_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        config.api_url = lookup("UNITER_API_URL").filter(|url| !url.is_empty());
        if let Some(value) = lookup("UNITER_CHARM_URL").filter(|url| !url.is_empty()) {
            let url = value
                .parse::<CharmUrl>()
                .map_err(|e| UniterError::Config(format!("UNITER_CHARM_URL: {e}")))?;
            config.charm_url = Some(url);
        }
        if let Some(value) = lookup("UNITER_LEADERSHIP") {
            config.leadership_enabled = parse_flag("UNITER_LEADERSHIP", &value)?;
        }
        if let Some(value) = lookup("UNITER_METRICS_POLL_SECONDS") {
            config.metrics_poll_interval_seconds =
                parse_number("UNITER_METRICS_POLL_SECONDS", &value)?;
        }
        if let Some(value) = lookup("UNITER_CLAIM_TIMEOUT_SECONDS") {
            config.leadership_claim_timeout_seconds =
                parse_number("UNITER_CLAIM_TIMEOUT_SECONDS", &value)?;
        }
        Ok(config)
    }

    /// The charm URL for a detached unit record.
    ///
    /// # Errors
    ///
    /// Returns `UniterError::Config` if `charm_url` is unset.
    pub fn detached_charm_url(&self) -> Result<CharmUrl> {
        self.charm_url.clone().ok_or_else(|| {
            UniterError::Config("UNITER_CHARM_URL is required without UNITER_API_URL".into())
        })
    }

    /// Get the metrics collection interval as a `Duration`.
    #[must_use]
    pub fn metrics_poll_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_poll_interval_seconds)
    }

    /// Get the leadership claim timeout as a `Duration`.
    #[must_use]
    pub fn leadership_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.leadership_claim_timeout_seconds)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(UniterError::Config(format!(
            "{key}: expected a boolean, got {value:?}"
        ))),
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| UniterError::Config(format!("{key}: expected seconds, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn default_config() {
        let config = UniterConfig::new("wordpress/0".parse().unwrap());
        assert!(config.leadership_enabled);
        assert!(config.api_url.is_none());
        assert_eq!(config.metrics_poll_interval(), Duration::from_secs(300));
        assert_eq!(config.leadership_claim_timeout(), Duration::from_secs(30));
        assert_eq!(config.event_queue_capacity, 64);
    }

    #[test]
    fn from_lookup_reads_overrides() {
        let config = UniterConfig::from_lookup(lookup(&[
            ("UNITER_UNIT", "mysql/2"),
            ("UNITER_DATA_DIR", "/tmp/state"),
            ("UNITER_API_URL", "http://controller:17070"),
            ("UNITER_LEADERSHIP", "off"),
            ("UNITER_METRICS_POLL_SECONDS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.unit.to_string(), "mysql/2");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/state"));
        assert_eq!(config.api_url.as_deref(), Some("http://controller:17070"));
        assert!(!config.leadership_enabled);
        assert_eq!(config.metrics_poll_interval(), Duration::from_secs(60));
        assert!(config.charm_url.is_none());
    }

    #[test]
    fn detached_unit_needs_charm_url() {
        let config = UniterConfig::from_lookup(lookup(&[("UNITER_UNIT", "mysql/0")])).unwrap();
        assert!(matches!(
            config.detached_charm_url(),
            Err(UniterError::Config(_))
        ));

        let config = UniterConfig::from_lookup(lookup(&[
            ("UNITER_UNIT", "mysql/0"),
            ("UNITER_CHARM_URL", "cs:mysql-3"),
        ]))
        .unwrap();
        let expected: CharmUrl = "cs:mysql-3".parse().unwrap();
        assert_eq!(config.detached_charm_url().unwrap(), expected);

        assert!(UniterConfig::from_lookup(lookup(&[
            ("UNITER_UNIT", "mysql/0"),
            ("UNITER_CHARM_URL", "not a charm"),
        ]))
        .is_err());
    }

    #[test]
    fn from_lookup_rejects_bad_values() {
        assert!(matches!(
            UniterConfig::from_lookup(lookup(&[])),
            Err(UniterError::Config(_))
        ));
        assert!(UniterConfig::from_lookup(lookup(&[("UNITER_UNIT", "not a unit")])).is_err());
        assert!(UniterConfig::from_lookup(lookup(&[
            ("UNITER_UNIT", "mysql/0"),
            ("UNITER_LEADERSHIP", "maybe"),
        ]))
        .is_err());
    }
}
