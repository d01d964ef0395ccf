use core_config::{
    ConfigError, FromEnv, env_duration_secs, env_or_default, env_parse, env_positive,
};
use std::time::Duration;

use crate::recipients::GuardianNamePolicy;

/// Tuning for the dispatch pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub send_timeout: Duration,
    /// Sends allowed per `rate_window`, shared by every dispatch in the process.
    pub rate_limit: usize,
    pub rate_window: Duration,
    /// Longest a send waits for a rate-limit slot before it is recorded as failed.
    pub rate_wait: Duration,
    pub cache_ttl: Duration,
    pub max_retries: u32,
    pub name_policy: GuardianNamePolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            concurrency: 5,
            send_timeout: Duration::from_secs(30),
            rate_limit: 100,
            rate_window: Duration::from_secs(60),
            rate_wait: Duration::from_secs(120),
            cache_ttl: Duration::from_secs(300),
            max_retries: 3,
            name_policy: GuardianNamePolicy::default(),
        }
    }
}

impl FromEnv for DispatchConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let raw_policy = env_or_default("NOTIFY_GUARDIAN_NAME_POLICY", "most_recently_updated");
        let name_policy = raw_policy.parse().map_err(|_| ConfigError::ParseError {
            key: "NOTIFY_GUARDIAN_NAME_POLICY".to_string(),
            details: format!("unknown policy '{}'", raw_policy),
        })?;

        Ok(Self {
            batch_size: env_positive("NOTIFY_BATCH_SIZE", defaults.batch_size)?,
            concurrency: env_positive("NOTIFY_CONCURRENCY", defaults.concurrency)?,
            send_timeout: env_duration_secs("NOTIFY_SEND_TIMEOUT_SECS", 30)?,
            rate_limit: env_positive("NOTIFY_RATE_LIMIT", defaults.rate_limit)?,
            rate_window: env_duration_secs("NOTIFY_RATE_WINDOW_SECS", 60)?,
            rate_wait: env_duration_secs("NOTIFY_RATE_WAIT_SECS", 120)?,
            cache_ttl: env_duration_secs("NOTIFY_CACHE_TTL_SECS", 300)?,
            max_retries: env_parse("NOTIFY_MAX_RETRIES", defaults.max_retries)?,
            name_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: [&str; 9] = [
        "NOTIFY_BATCH_SIZE",
        "NOTIFY_CONCURRENCY",
        "NOTIFY_SEND_TIMEOUT_SECS",
        "NOTIFY_RATE_LIMIT",
        "NOTIFY_RATE_WINDOW_SECS",
        "NOTIFY_RATE_WAIT_SECS",
        "NOTIFY_CACHE_TTL_SECS",
        "NOTIFY_MAX_RETRIES",
        "NOTIFY_GUARDIAN_NAME_POLICY",
    ];

    #[test]
    fn test_defaults_when_unset() {
        temp_env::with_vars(KEYS.map(|k| (k, None::<&str>)), || {
            assert_eq!(DispatchConfig::from_env().unwrap(), DispatchConfig::default());
        });
    }

    #[test]
    fn test_overrides() {
        temp_env::with_vars(
            [
                ("NOTIFY_BATCH_SIZE", Some("2")),
                ("NOTIFY_CONCURRENCY", Some("1")),
                ("NOTIFY_RATE_WAIT_SECS", Some("10")),
                ("NOTIFY_GUARDIAN_NAME_POLICY", Some("first_seen")),
            ],
            || {
                let config = DispatchConfig::from_env().unwrap();
                assert_eq!(config.batch_size, 2);
                assert_eq!(config.concurrency, 1);
                assert_eq!(config.rate_wait, Duration::from_secs(10));
                assert_eq!(config.name_policy, GuardianNamePolicy::FirstSeen);
            },
        );
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        temp_env::with_var("NOTIFY_CONCURRENCY", Some("0"), || {
            let err = DispatchConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("NOTIFY_CONCURRENCY"));
        });
    }

    #[test]
    fn test_unknown_name_policy_is_rejected() {
        temp_env::with_var("NOTIFY_GUARDIAN_NAME_POLICY", Some("alphabetical"), || {
            assert!(DispatchConfig::from_env().is_err());
        });
    }
}
