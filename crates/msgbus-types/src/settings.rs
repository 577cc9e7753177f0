//! Connection settings
//!
//! Process-wide parameters used to open every broker connection. Only the
//! endpoint and credentials come from configuration; heartbeat and recovery
//! policy are fixed defaults.

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const ENV_HOST: &str = "MSGBUS_HOST";
pub const ENV_PORT: &str = "MSGBUS_PORT";
pub const ENV_USERNAME: &str = "MSGBUS_USERNAME";
pub const ENV_PASSWORD: &str = "MSGBUS_PASSWORD";
pub const ENV_VHOST: &str = "MSGBUS_VHOST";

const DEFAULT_HEARTBEAT_SECS: u16 = 30;
const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 10_000;

/// Broker connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,

    /// Heartbeat requested from the broker, in seconds
    pub heartbeat_secs: u16,

    /// Re-establish long-lived consumers after a lost connection
    pub automatic_recovery: bool,

    /// Pause before each recovery attempt, in milliseconds
    pub recovery_interval_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            automatic_recovery: true,
            recovery_interval_ms: DEFAULT_RECOVERY_INTERVAL_MS,
        }
    }
}

impl ConnectionSettings {
    /// Default settings pointed at `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Load endpoint and credentials from `MSGBUS_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Some(host) = read_var(ENV_HOST)? {
            if host.trim().is_empty() {
                return Err(Error::Config(format!("{ENV_HOST} is empty")));
            }
            settings.host = host;
        }
        if let Some(port) = read_var(ENV_PORT)? {
            settings.port = port
                .parse()
                .map_err(|_| Error::Config(format!("{ENV_PORT} is not a port: {port}")))?;
        }
        if let Some(username) = read_var(ENV_USERNAME)? {
            settings.username = username;
        }
        if let Some(password) = read_var(ENV_PASSWORD)? {
            settings.password = password;
        }
        if let Some(vhost) = read_var(ENV_VHOST)? {
            settings.virtual_host = vhost;
        }

        Ok(settings)
    }

    pub fn with_automatic_recovery(mut self, enabled: bool) -> Self {
        self.automatic_recovery = enabled;
        self
    }

    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat_secs))
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    /// `host:port/vhost`, safe to log
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, display_vhost(&self.virtual_host))
    }
}

fn display_vhost(vhost: &str) -> String {
    if vhost.starts_with('/') {
        vhost.to_string()
    } else {
        format!("/{vhost}")
    }
}

fn read_var(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => {
            Err(Error::Config(format!("{name} is not valid unicode")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_settings() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 5672);
        assert_eq!(settings.heartbeat(), Duration::from_secs(30));
        assert!(settings.automatic_recovery);
        assert_eq!(settings.recovery_interval(), Duration::from_secs(10));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides_endpoint() {
        temp_env::with_vars(
            [
                (ENV_HOST, Some("rabbit.internal")),
                (ENV_PORT, Some("5673")),
                (ENV_VHOST, Some("orders")),
                (ENV_USERNAME, None),
                (ENV_PASSWORD, None),
            ],
            || {
                let settings = ConnectionSettings::from_env().unwrap();
                assert_eq!(settings.host, "rabbit.internal");
                assert_eq!(settings.port, 5673);
                assert_eq!(settings.username, "guest");
                assert_eq!(settings.endpoint(), "rabbit.internal:5673/orders");
                assert_eq!(settings.heartbeat_secs, 30);
            },
        );
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_port() {
        temp_env::with_vars(
            [(ENV_HOST, Some("rabbit")), (ENV_PORT, Some("amqp"))],
            || {
                let err = ConnectionSettings::from_env().unwrap_err();
                assert!(matches!(err, Error::Config(_)));
            },
        );
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_empty_host() {
        temp_env::with_var(ENV_HOST, Some("  "), || {
            assert!(matches!(
                ConnectionSettings::from_env(),
                Err(Error::Config(_))
            ));
        });
    }

    #[test]
    fn test_recovery_interval_keeps_subsecond_precision() {
        let settings =
            ConnectionSettings::default().with_recovery_interval(Duration::from_millis(500));
        assert_eq!(settings.recovery_interval(), Duration::from_millis(500));

        let settings = settings.with_recovery_interval(Duration::from_secs(3));
        assert_eq!(settings.recovery_interval_ms, 3_000);
    }

    #[test]
    fn test_deserialize_partial() {
        let settings: ConnectionSettings =
            serde_json::from_str(r#"{"host":"mq","automatic_recovery":false}"#).unwrap();
        assert_eq!(settings.host, "mq");
        assert!(!settings.automatic_recovery);
        assert_eq!(settings.recovery_interval_ms, 10_000);
        assert_eq!(settings.endpoint(), "mq:5672/");
    }
}
