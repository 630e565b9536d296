//! Process configuration, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default cycle interval: 5 minutes.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

/// Runtime configuration for the intake service.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Fixed interval between polling cycles.
    pub poll_interval: Duration,
    /// Admin HTTP port. `None` disables the admin server.
    pub admin_port: Option<u16>,
    /// Socket timeout for mailbox and SMTP I/O.
    pub network_timeout: Duration,
    /// Task-title cap in characters, ellipsis included.
    pub title_max_chars: usize,
    /// Upper bound on messages written per target per cycle. Ledger hits and
    /// skipped messages do not count against it.
    pub max_messages_per_target: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/mail-intake.db"),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            admin_port: Some(8080),
            network_timeout: Duration::from_secs(30),
            title_max_chars: 50,
            max_messages_per_target: 200,
        }
    }
}

impl IntakeConfig {
    /// Build config from environment variables, falling back to defaults for
    /// anything unset. Set-but-unparseable values are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = std::env::var("MAIL_INTAKE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let poll_interval = env_parse::<u64>("MAIL_INTAKE_POLL_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);
        if poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_INTAKE_POLL_INTERVAL_SECS".into(),
                message: "interval must be at least one second".into(),
            });
        }

        let admin_port = match env_parse::<u16>("MAIL_INTAKE_ADMIN_PORT")? {
            Some(0) => None,
            Some(port) => Some(port),
            None => defaults.admin_port,
        };

        let network_timeout = env_parse::<u64>("MAIL_INTAKE_NETWORK_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.network_timeout);

        let title_max_chars =
            env_parse::<usize>("MAIL_INTAKE_TITLE_MAX_CHARS")?.unwrap_or(defaults.title_max_chars);
        if title_max_chars < 4 {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_INTAKE_TITLE_MAX_CHARS".into(),
                message: "cap must leave room for the ellipsis".into(),
            });
        }

        let max_messages_per_target = env_parse::<usize>("MAIL_INTAKE_MAX_MESSAGES_PER_TARGET")?
            .unwrap_or(defaults.max_messages_per_target);

        Ok(Self {
            db_path,
            poll_interval,
            admin_port,
            network_timeout,
            title_max_chars,
            max_messages_per_target,
        })
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = IntakeConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(300));
        assert_eq!(config.title_max_chars, 50);
        assert_eq!(config.admin_port, Some(8080));
    }

    #[test]
    fn env_parse_rejects_garbage() {
        // SAFETY: the key is unique to this test; no other test reads it.
        unsafe { std::env::set_var("MAIL_INTAKE_TEST_GARBAGE", "ten") };
        let result = env_parse::<u64>("MAIL_INTAKE_TEST_GARBAGE");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        unsafe { std::env::remove_var("MAIL_INTAKE_TEST_GARBAGE") };
    }

    #[test]
    fn env_parse_missing_is_none() {
        let result = env_parse::<u64>("MAIL_INTAKE_TEST_DEFINITELY_UNSET").unwrap();
        assert!(result.is_none());
    }
}
