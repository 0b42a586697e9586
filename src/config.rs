//! Mesh Configuration
//!
//! Timeouts, retry limits and hop budgets for a mesh node. Keys are
//! camelCase so the same object can be handed over by the chat front end.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{MeshError, MeshResult};

/// Default hop budget for originated messages
pub const DEFAULT_TTL: u8 = 10;

/// Configuration for a mesh node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshConfig {
    pub default_ttl: u8,
    pub max_retries: u32,
    pub ack_timeout_ms: u64,
    pub stale_after_ms: u64,
    pub offline_after_ms: u64,
    pub discovery_window_ms: u64,
    /// Grace period after which an OFFLINE peer is forgotten
    pub remove_after_ms: u64,
    /// Period of ROUTE_UPDATE advertisements; also keeps neighbors alive
    pub advertise_interval_ms: u64,
    pub announce_interval_ms: u64,
    pub liveness_sweep_interval_ms: u64,
    pub reliability_sweep_interval_ms: u64,
    pub dedup_capacity: usize,
    pub dedup_ttl_ms: u64,
    /// Costs at or above this value count as unreachable
    pub max_route_cost: u32,
    /// Consecutive failed sends before a neighbor is considered lost
    pub link_failure_threshold: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            max_retries: 3,
            ack_timeout_ms: 2_000,
            stale_after_ms: 15_000,
            offline_after_ms: 30_000,
            discovery_window_ms: 1_000,
            remove_after_ms: 120_000,
            advertise_interval_ms: 5_000,
            announce_interval_ms: 30_000,
            liveness_sweep_interval_ms: 1_000,
            reliability_sweep_interval_ms: 250,
            dedup_capacity: 1024,
            dedup_ttl_ms: 300_000,
            max_route_cost: 16,
            link_failure_threshold: 3,
        }
    }
}

impl MeshConfig {
    /// Parse and validate a configuration object
    pub fn from_json_str(json: &str) -> MeshResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Export configuration to JSON
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Merge a partial configuration object into this one.
    ///
    /// Unknown keys are ignored. The merged result must validate, otherwise
    /// `self` is left untouched.
    pub fn update_from_json(&mut self, json: Value) -> Result<()> {
        let updates = json
            .as_object()
            .context("Configuration update must be a JSON object")?;

        let mut merged = self.to_json();
        if let Some(current) = merged.as_object_mut() {
            for (key, value) in updates {
                if current.contains_key(key) {
                    current.insert(key.clone(), value.clone());
                } else {
                    log::debug!("Ignoring unknown configuration key: {}", key);
                }
            }
        }

        let candidate: Self =
            serde_json::from_value(merged).context("Invalid configuration value")?;
        candidate.validate()?;

        *self = candidate;
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> MeshResult<()> {
        if self.default_ttl == 0 {
            return Err(MeshError::Config("defaultTtl must be greater than 0".into()));
        }
        // every retry carries a distinct u8 attempt number
        if self.max_retries > u32::from(u8::MAX) {
            return Err(MeshError::Config(format!(
                "maxRetries must not exceed {}",
                u8::MAX
            )));
        }
        if self.ack_timeout_ms == 0 {
            return Err(MeshError::Config("ackTimeoutMs must be greater than 0".into()));
        }
        if self.stale_after_ms == 0 || self.offline_after_ms <= self.stale_after_ms {
            return Err(MeshError::Config(
                "offlineAfterMs must be greater than staleAfterMs".into(),
            ));
        }
        if self.remove_after_ms < self.offline_after_ms {
            return Err(MeshError::Config(
                "removeAfterMs must not be shorter than offlineAfterMs".into(),
            ));
        }
        if self.advertise_interval_ms == 0
            || self.announce_interval_ms == 0
            || self.liveness_sweep_interval_ms == 0
            || self.reliability_sweep_interval_ms == 0
        {
            return Err(MeshError::Config("Sweep and advertise intervals must be greater than 0".into()));
        }
        if self.advertise_interval_ms >= self.stale_after_ms {
            return Err(MeshError::Config(
                "advertiseIntervalMs must be shorter than staleAfterMs".into(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(MeshError::Config("dedupCapacity must be greater than 0".into()));
        }
        if self.max_route_cost < 2 {
            return Err(MeshError::Config("maxRouteCost must be at least 2".into()));
        }
        if self.link_failure_threshold == 0 {
            return Err(MeshError::Config("linkFailureThreshold must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn offline_after(&self) -> Duration {
        Duration::from_millis(self.offline_after_ms)
    }

    pub fn remove_after(&self) -> Duration {
        Duration::from_millis(self.remove_after_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn advertise_interval(&self) -> Duration {
        Duration::from_millis(self.advertise_interval_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn liveness_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_sweep_interval_ms)
    }

    pub fn reliability_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.reliability_sweep_interval_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }
}
