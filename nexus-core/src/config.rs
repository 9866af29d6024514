//! Runtime configuration.
//!
//! Every setting has a default and can be overridden from `NEXUS_*`
//! environment variables via [`NexusConfig::from_env`].

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Feature flag enabling reverse-link maintenance for soft links.
pub const RLINK_FEATURE_FLAG: &str = "rlink";

/// Backoff for individual store calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 32,
            initial_backoff_ms: 10,
            max_backoff_ms: 5000,
            backoff_multiplier: 2,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0 based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let mut ms = self.initial_backoff_ms;
        for _ in 0..attempt {
            if ms >= self.max_backoff_ms {
                break;
            }
            ms = ms.saturating_mul(u64::from(self.backoff_multiplier));
        }
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}

/// Bounds for the read, merge, compare-and-swap property update loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for UpdateRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 100,
            retry_delay_ms: 100,
        }
    }
}

/// Notification bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Store prefix watched for graph mutations.
    pub watch_prefix: String,
    /// Delay applied before each notification reaches the cache.
    pub message_delay_ms: u64,
    pub created_buffer_rotation_secs: u64,
    pub created_buffer_max_entries: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            watch_prefix: "/".to_string(),
            message_delay_ms: 0,
            created_buffer_rotation_secs: 3600,
            created_buffer_max_entries: 100_000,
        }
    }
}

/// What to do when the cache can no longer converge with the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatalPolicy {
    /// Abort the process.
    #[default]
    Abort,
    /// Panic the current task.
    Panic,
}

impl FromStr for FatalPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(FatalPolicy::Abort),
            "panic" => Ok(FatalPolicy::Panic),
            other => Err(ConfigError::InvalidValue {
                field: "fatal_policy".to_string(),
                value: other.to_string(),
                reason: "expected abort or panic".to_string(),
            }),
        }
    }
}

/// Top-level configuration of a data model instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NexusConfig {
    pub retry: RetryConfig,
    pub update_retry: UpdateRetryConfig,
    pub bus: BusConfig,
    pub fatal_policy: FatalPolicy,
    pub feature_flags: Vec<String>,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            update_retry: UpdateRetryConfig::default(),
            bus: BusConfig::default(),
            fatal_policy: FatalPolicy::default(),
            feature_flags: vec![RLINK_FEATURE_FLAG.to_string()],
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl NexusConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let fatal_policy = match std::env::var("NEXUS_FATAL_POLICY") {
            Ok(s) => s.parse()?,
            Err(_) => d.fatal_policy,
        };
        let feature_flags = std::env::var("NEXUS_FEATURE_FLAGS")
            .map(|s| parse_feature_flags(&s))
            .unwrap_or(d.feature_flags);

        Ok(Self {
            retry: RetryConfig {
                max_retries: env_parse("NEXUS_RETRY_MAX").unwrap_or(d.retry.max_retries),
                initial_backoff_ms: env_parse("NEXUS_RETRY_INITIAL_MS")
                    .unwrap_or(d.retry.initial_backoff_ms),
                max_backoff_ms: env_parse("NEXUS_RETRY_MAX_BACKOFF_MS")
                    .unwrap_or(d.retry.max_backoff_ms),
                backoff_multiplier: d.retry.backoff_multiplier,
            },
            update_retry: UpdateRetryConfig {
                max_retries: env_parse("NEXUS_UPDATE_RETRY_MAX")
                    .unwrap_or(d.update_retry.max_retries),
                retry_delay_ms: env_parse("NEXUS_UPDATE_RETRY_DELAY_MS")
                    .unwrap_or(d.update_retry.retry_delay_ms),
            },
            bus: BusConfig {
                watch_prefix: std::env::var("NEXUS_WATCH_PREFIX").unwrap_or(d.bus.watch_prefix),
                message_delay_ms: env_parse("NEXUS_MESSAGE_DELAY_MS")
                    .unwrap_or(d.bus.message_delay_ms),
                ..d.bus
            },
            fatal_policy,
            feature_flags,
        })
    }

    pub fn rlink_enabled(&self) -> bool {
        self.feature_flags.iter().any(|f| f == RLINK_FEATURE_FLAG)
    }
}

/// Split a `;`-separated flag string, dropping empty entries.
pub fn parse_feature_flags(s: &str) -> Vec<String> {
    s.split(';')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(String::from)
        .collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.backoff(0), Duration::from_millis(10));
        assert_eq!(cfg.backoff(1), Duration::from_millis(20));
        assert_eq!(cfg.backoff(3), Duration::from_millis(80));
        assert_eq!(cfg.backoff(20), Duration::from_millis(5000));
    }

    #[test]
    fn test_fatal_policy_parse() {
        assert_eq!("Panic".parse::<FatalPolicy>(), Ok(FatalPolicy::Panic));
        assert_eq!("abort".parse::<FatalPolicy>(), Ok(FatalPolicy::Abort));
        assert!("explode".parse::<FatalPolicy>().is_err());
    }

    #[test]
    fn test_feature_flags() {
        assert_eq!(parse_feature_flags("rlink;;debug:9000 "), vec!["rlink", "debug:9000"]);
        assert!(NexusConfig::default().rlink_enabled());
        let cfg = NexusConfig {
            feature_flags: vec![],
            ..Default::default()
        };
        assert!(!cfg.rlink_enabled());
    }

    #[test]
    fn test_config_serde() {
        let cfg = NexusConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        assert!(json.contains("watch_prefix"));
        let back: NexusConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, cfg);
    }
}
