use crate::{env_or_default, env_parse, ConfigError, FromEnv};
use std::net::Ipv4Addr;

/// Admin HTTP server configuration (health, readiness, metrics)
#[derive(Clone, Debug)]
pub struct AdminServerConfig {
    pub host: String,
    pub port: u16,
}

impl AdminServerConfig {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromEnv for AdminServerConfig {
    /// - NOTIFY_ADMIN_HOST: defaults to 0.0.0.0
    /// - NOTIFY_ADMIN_PORT: defaults to 8085
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or_default("NOTIFY_ADMIN_HOST", &Ipv4Addr::UNSPECIFIED.to_string()),
            port: env_parse("NOTIFY_ADMIN_PORT", 8085)?,
        })
    }
}

impl Default for AdminServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED.to_string(),
            port: 8085,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_config_defaults() {
        temp_env::with_vars(
            [
                ("NOTIFY_ADMIN_HOST", None::<&str>),
                ("NOTIFY_ADMIN_PORT", None::<&str>),
            ],
            || {
                let config = AdminServerConfig::from_env().unwrap();
                assert_eq!(config.address(), "0.0.0.0:8085");
            },
        );
    }

    #[test]
    fn test_admin_config_custom_port() {
        temp_env::with_var("NOTIFY_ADMIN_PORT", Some("9100"), || {
            let config = AdminServerConfig::from_env().unwrap();
            assert_eq!(config.port, 9100);
        });
    }

    #[test]
    fn test_admin_config_invalid_port() {
        temp_env::with_var("NOTIFY_ADMIN_PORT", Some("99999"), || {
            let err = AdminServerConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("NOTIFY_ADMIN_PORT"));
        });
    }
}
