//! Configuration module for the vigil HA coordinator.

use crate::error::{Result, VigilError};
use crate::types::HypervisorFamily;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the HA coordinator.
///
/// All intervals are wall-clock durations; persisted retry times are
/// derived from them as epoch-second offsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VigilConfig {
    /// Number of worker tasks claiming and executing work items.
    pub ha_workers: usize,
    /// How long an idle worker waits before polling the store again.
    #[serde(with = "humantime_serde")]
    pub time_to_sleep: Duration,
    /// Attempts before a work item is given up on.
    pub max_retries: u32,
    /// Window for retry carry-over and terminal-item retention.
    #[serde(with = "humantime_serde")]
    pub time_between_failures: Duration,
    /// Period of the cleanup task purging terminal items.
    #[serde(with = "humantime_serde")]
    pub time_between_cleanup: Duration,
    /// Reschedule delta after a failed stop or destroy.
    #[serde(with = "humantime_serde")]
    pub stop_retry_interval: Duration,
    /// Reschedule delta after a failed restart attempt.
    #[serde(with = "humantime_serde")]
    pub restart_retry_interval: Duration,
    /// Reschedule delta after a failed migration attempt.
    #[serde(with = "humantime_serde")]
    pub migrate_retry_interval: Duration,
    /// Reschedule delta while investigation has to be repeated.
    #[serde(with = "humantime_serde")]
    pub investigate_retry_interval: Duration,
    /// Force HA handling even for VMs that did not opt in.
    pub force_ha: bool,
    /// Peer label used in logs.
    pub instance: String,
    /// Optional tag injected into HA start parameters.
    pub ha_tag: Option<String>,
    /// Hypervisor families whose host stack already restarts lost VMs;
    /// the coordinator skips HA for them entirely.
    pub hypervisors_with_host_side_ha: Vec<HypervisorFamily>,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            ha_workers: 5,
            time_to_sleep: Duration::from_secs(60),
            max_retries: 5,
            time_between_failures: Duration::from_secs(3600),
            time_between_cleanup: Duration::from_secs(86400),
            stop_retry_interval: Duration::from_secs(120),
            restart_retry_interval: Duration::from_secs(600),
            migrate_retry_interval: Duration::from_secs(120),
            investigate_retry_interval: Duration::from_secs(60),
            force_ha: false,
            instance: "VMOPS".to_string(),
            ha_tag: None,
            hypervisors_with_host_side_ha: vec![HypervisorFamily::Vmware, HypervisorFamily::Hyperv],
        }
    }
}

impl VigilConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.ha_workers == 0 {
            return Err(VigilError::InvalidConfig {
                field: "ha_workers".to_string(),
                reason: "worker pool must have at least one worker".to_string(),
            });
        }

        if self.max_retries == 0 {
            return Err(VigilError::InvalidConfig {
                field: "max_retries".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }

        for (field, interval) in [
            ("stop_retry_interval", self.stop_retry_interval),
            ("restart_retry_interval", self.restart_retry_interval),
            ("migrate_retry_interval", self.migrate_retry_interval),
            ("investigate_retry_interval", self.investigate_retry_interval),
        ] {
            if interval.is_zero() {
                return Err(VigilError::InvalidConfig {
                    field: field.to_string(),
                    reason: "retry interval must be non-zero".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Create a configuration with short intervals for development and tests.
    pub fn development() -> Self {
        Self {
            ha_workers: 2,
            time_to_sleep: Duration::from_millis(50),
            max_retries: 5,
            time_between_failures: Duration::from_secs(60),
            time_between_cleanup: Duration::from_secs(300),
            stop_retry_interval: Duration::from_secs(1),
            restart_retry_interval: Duration::from_secs(1),
            migrate_retry_interval: Duration::from_secs(1),
            investigate_retry_interval: Duration::from_secs(1),
            ..Default::default()
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
