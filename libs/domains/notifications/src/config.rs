//! Dispatch configuration.

use crate::models::Channel;
use core_config::{ConfigError, FromEnv, env_duration_ms, env_duration_secs, env_or_default, env_parse};
use job_queue::{BackoffPolicy, QueueConfig};
use std::collections::HashMap;
use std::time::Duration;
use strum::IntoEnumIterator;

/// Retry parameters for one channel class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl ChannelPolicy {
    pub fn new(max_attempts: u32, base: Duration, ceiling: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffPolicy::new(base, ceiling),
        }
    }

    /// Built-in defaults. Carrier channels tolerate longer backoff than in-process ones.
    pub fn default_for(channel: Channel) -> Self {
        match channel {
            Channel::Email => Self::new(5, Duration::from_secs(30), Duration::from_secs(3600)),
            Channel::Sms => Self::new(4, Duration::from_secs(10), Duration::from_secs(600)),
            Channel::Push => Self::new(4, Duration::from_secs(5), Duration::from_secs(300)),
            Channel::Team | Channel::User | Channel::InApp | Channel::ScheduledUser => {
                Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
            }
        }
    }

    /// Read `NOTIFY_<CHANNEL>_*` overrides on top of the defaults.
    fn from_env_for(channel: Channel) -> Result<Self, ConfigError> {
        let defaults = Self::default_for(channel);
        let key = channel.env_key();

        let max_attempts_key = format!("NOTIFY_{}_MAX_ATTEMPTS", key);
        let max_attempts = env_parse(&max_attempts_key, defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: max_attempts_key,
                details: "must be at least 1".to_string(),
            });
        }

        let base = env_duration_ms(&format!("NOTIFY_{}_BACKOFF_BASE_MS", key), defaults.backoff.base)?;
        let ceiling = env_duration_ms(
            &format!("NOTIFY_{}_BACKOFF_CEILING_MS", key),
            defaults.backoff.ceiling,
        )?;

        Ok(Self::new(max_attempts, base, ceiling))
    }
}

/// Policy per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPolicies {
    policies: HashMap<Channel, ChannelPolicy>,
}

impl ChannelPolicies {
    pub fn get(&self, channel: Channel) -> ChannelPolicy {
        self.policies
            .get(&channel)
            .copied()
            .unwrap_or_else(|| ChannelPolicy::default_for(channel))
    }

    pub fn with_policy(mut self, channel: Channel, policy: ChannelPolicy) -> Self {
        self.policies.insert(channel, policy);
        self
    }
}

impl Default for ChannelPolicies {
    fn default() -> Self {
        Self {
            policies: Channel::iter()
                .map(|channel| (channel, ChannelPolicy::default_for(channel)))
                .collect(),
        }
    }
}

impl FromEnv for ChannelPolicies {
    fn from_env() -> Result<Self, ConfigError> {
        let policies = Channel::iter()
            .map(|channel| Ok((channel, ChannelPolicy::from_env_for(channel)?)))
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;
        Ok(Self { policies })
    }
}

/// Worker pool and queue settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Claim lease; a job not resolved within it is handed to another worker.
    pub lease: Duration,
    /// Sleep between claims when the queue has nothing due.
    pub idle_poll: Duration,
    /// Upper bound on one sender invocation; elapsing counts as retryable.
    pub send_timeout: Duration,
    /// Max concurrent sends within one fan-out.
    pub fanout_concurrency: usize,
    pub queue: QueueConfig,
    pub policies: ChannelPolicies,
}

impl DispatchConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn with_fanout_concurrency(mut self, concurrency: usize) -> Self {
        self.fanout_concurrency = concurrency;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_policies(mut self, policies: ChannelPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// How often a worker renews its lease while sends are running. A third
    /// of the lease leaves two renewals of slack before expiry.
    pub fn lease_renewal(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(1))
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease: Duration::from_secs(30),
            idle_poll: Duration::from_millis(250),
            send_timeout: Duration::from_secs(10),
            fanout_concurrency: 16,
            queue: QueueConfig::new("notify"),
            policies: ChannelPolicies::default(),
        }
    }
}

impl FromEnv for DispatchConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let workers = env_parse("NOTIFY_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                key: "NOTIFY_WORKERS".to_string(),
                details: "must be at least 1".to_string(),
            });
        }
        let fanout_concurrency = env_parse("NOTIFY_FANOUT_CONCURRENCY", defaults.fanout_concurrency)?;
        if fanout_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "NOTIFY_FANOUT_CONCURRENCY".to_string(),
                details: "must be at least 1".to_string(),
            });
        }
        let send_timeout = env_duration_ms("NOTIFY_SEND_TIMEOUT_MS", defaults.send_timeout)?;
        let lease = env_duration_ms("NOTIFY_LEASE_MS", defaults.lease)?;
        if lease <= send_timeout {
            return Err(ConfigError::Invalid {
                key: "NOTIFY_LEASE_MS".to_string(),
                details: "must exceed NOTIFY_SEND_TIMEOUT_MS".to_string(),
            });
        }

        let queue = QueueConfig::new(env_or_default("NOTIFY_QUEUE_NAME", &defaults.queue.name))
            .with_max_depth(env_parse("NOTIFY_MAX_QUEUE_DEPTH", defaults.queue.max_depth)?)
            .with_dedupe_window(env_duration_secs(
                "NOTIFY_DEDUPE_WINDOW_SECS",
                defaults.queue.dedupe_window,
            )?)
            .with_retention(env_duration_secs("NOTIFY_RETENTION_SECS", defaults.queue.retention)?);

        Ok(Self {
            workers,
            lease,
            idle_poll: env_duration_ms("NOTIFY_IDLE_POLL_MS", defaults.idle_poll)?,
            send_timeout,
            fanout_concurrency,
            queue,
            policies: ChannelPolicies::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 9] = [
        "NOTIFY_WORKERS",
        "NOTIFY_LEASE_MS",
        "NOTIFY_IDLE_POLL_MS",
        "NOTIFY_SEND_TIMEOUT_MS",
        "NOTIFY_FANOUT_CONCURRENCY",
        "NOTIFY_MAX_QUEUE_DEPTH",
        "NOTIFY_DEDUPE_WINDOW_SECS",
        "NOTIFY_RETENTION_SECS",
        "NOTIFY_QUEUE_NAME",
    ];

    /// Every dispatch variable, unset unless overridden.
    fn vars(overrides: &[(&'static str, &'static str)]) -> Vec<(&'static str, Option<&'static str>)> {
        VARS.iter()
            .map(|key| {
                let value = overrides.iter().find(|(k, _)| k == key).map(|(_, v)| *v);
                (*key, value)
            })
            .collect()
    }

    #[test]
    fn test_defaults() {
        temp_env::with_vars(vars(&[]), || {
            let config = DispatchConfig::from_env().unwrap();
            assert_eq!(config.workers, 4);
            assert_eq!(config.lease, Duration::from_secs(30));
            assert_eq!(config.idle_poll, Duration::from_millis(250));
            assert_eq!(config.send_timeout, Duration::from_secs(10));
            assert_eq!(config.fanout_concurrency, 16);
            assert_eq!(config.queue.name, "notify");
            assert_eq!(config.queue.max_depth, 100_000);
            assert_eq!(config.queue.dedupe_window, Duration::from_secs(3600));
            assert_eq!(config.queue.retention, Duration::from_secs(86_400));
        });
    }

    #[test]
    fn test_overrides() {
        let overrides = [
            ("NOTIFY_WORKERS", "8"),
            ("NOTIFY_QUEUE_NAME", "erp-notify"),
            ("NOTIFY_MAX_QUEUE_DEPTH", "0"),
        ];
        temp_env::with_vars(vars(&overrides), || {
            let config = DispatchConfig::from_env().unwrap();
            assert_eq!(config.workers, 8);
            assert_eq!(config.queue.name, "erp-notify");
            assert!(!config.queue.is_bounded());
        });
    }

    #[test]
    fn test_rejects_zero_workers_and_short_lease() {
        temp_env::with_vars(vars(&[("NOTIFY_WORKERS", "0")]), || {
            assert!(DispatchConfig::from_env().is_err());
        });

        let overrides = [("NOTIFY_LEASE_MS", "5000"), ("NOTIFY_SEND_TIMEOUT_MS", "5000")];
        temp_env::with_vars(vars(&overrides), || {
            let err = DispatchConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("NOTIFY_LEASE_MS"));
        });
    }

    #[test]
    fn test_lease_renewal_is_a_third_of_the_lease() {
        let config = DispatchConfig::default().with_lease(Duration::from_millis(300));
        assert_eq!(config.lease_renewal(), Duration::from_millis(100));
        assert_eq!(
            DispatchConfig::default().with_lease(Duration::ZERO).lease_renewal(),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn test_channel_policy_overrides() {
        temp_env::with_vars(
            [
                ("NOTIFY_EMAIL_MAX_ATTEMPTS", Some("7")),
                ("NOTIFY_EMAIL_BACKOFF_BASE_MS", Some("2000")),
                ("NOTIFY_EMAIL_BACKOFF_CEILING_MS", None),
                ("NOTIFY_IN_APP_MAX_ATTEMPTS", Some("2")),
            ],
            || {
                let policies = ChannelPolicies::from_env().unwrap();
                let email = policies.get(Channel::Email);
                assert_eq!(email.max_attempts, 7);
                assert_eq!(email.backoff.base, Duration::from_secs(2));
                assert_eq!(email.backoff.ceiling, Duration::from_secs(3600));
                assert_eq!(policies.get(Channel::InApp).max_attempts, 2);
            },
        );
    }

    #[test]
    fn test_channel_policy_rejects_zero_attempts() {
        temp_env::with_var("NOTIFY_SMS_MAX_ATTEMPTS", Some("0"), || {
            let err = ChannelPolicies::from_env().unwrap_err();
            assert!(err.to_string().contains("NOTIFY_SMS_MAX_ATTEMPTS"));
        });
    }

    #[test]
    fn test_carrier_channels_back_off_longer() {
        let policies = ChannelPolicies::default();
        assert!(policies.get(Channel::Email).backoff.base > policies.get(Channel::InApp).backoff.base);
        assert!(policies.get(Channel::Sms).backoff.ceiling > policies.get(Channel::User).backoff.ceiling);
    }
}
