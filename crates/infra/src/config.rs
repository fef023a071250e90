//! Pipeline configuration loading.

use std::time::Duration;

use thiserror::Error;

use crate::dispatcher::RetryPolicy;
use crate::projections::SequencePolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Synchronization pipeline configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Number of dispatcher lanes (parallelism across aggregates)
    pub lanes: usize,
    /// Bounded queue size per lane
    pub lane_capacity: usize,
    pub retry: RetryPolicy,
    pub sequence_policy: SequencePolicy,
    /// TTL applied to cache entries written without an explicit TTL
    pub cache_ttl: Duration,
    /// Redis connection string; `None` selects the in-memory cache
    pub redis_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lanes: 4,
            lane_capacity: 1024,
            retry: RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10)),
            sequence_policy: SequencePolicy::LastWriterWins,
            cache_ttl: Duration::from_secs(300),
            redis_url: None,
        }
    }
}

impl SyncConfig {
    /// Load from `READSYNC_*` / `REDIS_URL` environment variables, falling back to
    /// defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let lanes = parse_positive(get("READSYNC_LANES"), "READSYNC_LANES", defaults.lanes as u64)? as usize;
        let lane_capacity = parse_positive(
            get("READSYNC_LANE_CAPACITY"),
            "READSYNC_LANE_CAPACITY",
            defaults.lane_capacity as u64,
        )? as usize;

        let max_attempts = parse_u64(
            get("READSYNC_MAX_ATTEMPTS"),
            "READSYNC_MAX_ATTEMPTS",
            u64::from(defaults.retry.max_attempts),
        )?;
        let max_attempts = u32::try_from(max_attempts).map_err(|_| ConfigError::Invalid {
            key: "READSYNC_MAX_ATTEMPTS",
            value: max_attempts.to_string(),
            reason: "out of range",
        })?;
        let base_delay = parse_u64(
            get("READSYNC_BASE_DELAY_MS"),
            "READSYNC_BASE_DELAY_MS",
            defaults.retry.base_delay.as_millis() as u64,
        )?;
        let max_delay = parse_u64(
            get("READSYNC_MAX_DELAY_MS"),
            "READSYNC_MAX_DELAY_MS",
            defaults.retry.max_delay.as_millis() as u64,
        )?;

        let sequence_policy = match get("READSYNC_SEQUENCE_POLICY") {
            None => defaults.sequence_policy,
            Some(raw) => SequencePolicy::parse(&raw).ok_or(ConfigError::Invalid {
                key: "READSYNC_SEQUENCE_POLICY",
                value: raw,
                reason: "expected last_writer_wins or contiguous",
            })?,
        };

        let cache_ttl = parse_positive(
            get("READSYNC_CACHE_TTL_SECS"),
            "READSYNC_CACHE_TTL_SECS",
            defaults.cache_ttl.as_secs(),
        )?;

        Ok(Self {
            lanes,
            lane_capacity,
            retry: RetryPolicy::exponential(
                max_attempts,
                Duration::from_millis(base_delay),
                Duration::from_millis(max_delay.max(base_delay)),
            ),
            sequence_policy,
            cache_ttl: Duration::from_secs(cache_ttl),
            redis_url: get("REDIS_URL"),
        })
    }

    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes.max(1);
        self
    }

    pub fn with_lane_capacity(mut self, capacity: usize) -> Self {
        self.lane_capacity = capacity.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sequence_policy(mut self, policy: SequencePolicy) -> Self {
        self.sequence_policy = policy;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }
}

fn parse_u64(raw: Option<String>, key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            value,
            reason: "not an unsigned integer",
        }),
    }
}

fn parse_positive(raw: Option<String>, key: &'static str, default: u64) -> Result<u64, ConfigError> {
    let parsed = parse_u64(raw, key, default)?;
    if parsed == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: parsed.to_string(),
            reason: "must be greater than zero",
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn unset_values_fall_back_to_defaults() {
        assert_eq!(load(&[]).unwrap(), SyncConfig::default());
    }

    #[test]
    fn reads_every_setting() {
        let config = load(&[
            ("READSYNC_LANES", "8"),
            ("READSYNC_LANE_CAPACITY", "16"),
            ("READSYNC_MAX_ATTEMPTS", "2"),
            ("READSYNC_BASE_DELAY_MS", "50"),
            ("READSYNC_MAX_DELAY_MS", "400"),
            ("READSYNC_SEQUENCE_POLICY", "contiguous"),
            ("READSYNC_CACHE_TTL_SECS", "60"),
            ("REDIS_URL", "redis://localhost:6379"),
        ])
        .unwrap();

        assert_eq!(config.lanes, 8);
        assert_eq!(config.lane_capacity, 16);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay, Duration::from_millis(50));
        assert_eq!(config.retry.max_delay, Duration::from_millis(400));
        assert_eq!(config.sequence_policy, SequencePolicy::Contiguous);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(matches!(
            load(&[("READSYNC_LANES", "0")]),
            Err(ConfigError::Invalid { key: "READSYNC_LANES", .. })
        ));
        assert!(matches!(
            load(&[("READSYNC_MAX_ATTEMPTS", "many")]),
            Err(ConfigError::Invalid { key: "READSYNC_MAX_ATTEMPTS", .. })
        ));
        assert!(matches!(
            load(&[("READSYNC_SEQUENCE_POLICY", "fifo")]),
            Err(ConfigError::Invalid { key: "READSYNC_SEQUENCE_POLICY", .. })
        ));
    }

    #[test]
    fn builders_clamp_to_usable_values() {
        let config = SyncConfig::default().with_lanes(0).with_lane_capacity(0);

        assert_eq!(config.lanes, 1);
        assert_eq!(config.lane_capacity, 1);
    }
}
