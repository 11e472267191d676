use crate::{env_optional, env_parse, ConfigError, FromEnv};

/// Redis connection settings.
///
/// Redis is optional: when `REDIS_URL` is unset, callers fall back to an
/// in-process backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisConfig {
    pub url: Option<String>,
    /// Connection attempts before giving up at startup
    pub connect_retries: u32,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            connect_retries: 3,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }
}

impl FromEnv for RedisConfig {
    /// - REDIS_URL: optional
    /// - REDIS_CONNECT_RETRIES: defaults to 3
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_optional("REDIS_URL");
        if let Some(url) = &url
            && !(url.starts_with("redis://") || url.starts_with("rediss://"))
        {
            return Err(ConfigError::Invalid {
                key: "REDIS_URL".to_string(),
                details: "expected a redis:// or rediss:// URL".to_string(),
            });
        }

        Ok(Self {
            url,
            connect_retries: env_parse("REDIS_CONNECT_RETRIES", 3)?,
        })
    }
}
