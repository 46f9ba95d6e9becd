//! Environment-backed configuration for `chatsync-demo`.

use std::{env, error::Error, fmt};

use chatsync_core::SessionConfig;
use chatsync_platform::ConnectionCredential;

const CONNECTION_STRING_KEY: &str = "CHATSYNC_CONNECTION_STRING";

/// Runtime configuration used by the demo.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    /// Credential handed to the chat service on connect.
    pub credential: ConnectionCredential,
    /// Store tuning forwarded to the dispatcher.
    pub session: SessionConfig,
}

impl DemoConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let Some(raw_credential) = optional_trimmed_env(CONNECTION_STRING_KEY, &mut lookup) else {
            return Err(ConfigError::Missing {
                key: CONNECTION_STRING_KEY,
            });
        };
        let credential = ConnectionCredential::parse(&raw_credential).map_err(|err| {
            ConfigError::InvalidValue {
                key: CONNECTION_STRING_KEY,
                value: "<redacted>".to_owned(),
                reason: err.to_string(),
            }
        })?;

        let defaults = SessionConfig::default();
        let event_log_capacity = parse_optional_usize(
            "CHATSYNC_EVENT_LOG_CAPACITY",
            defaults.event_log_capacity,
            &mut lookup,
        )?;
        let message_limit = parse_optional_usize(
            "CHATSYNC_MESSAGE_LIMIT",
            defaults.message_limit,
            &mut lookup,
        )?;
        let refresh_delay_ms = parse_optional_u64_with_default(
            "CHATSYNC_REFRESH_DELAY_MS",
            defaults.refresh_delay_ms,
            &mut lookup,
        )?;
        let name_pool = match optional_trimmed_env("CHATSYNC_NAME_POOL", &mut lookup) {
            Some(value) => parse_name_pool("CHATSYNC_NAME_POOL", &value)?,
            None => defaults.name_pool,
        };

        if event_log_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHATSYNC_EVENT_LOG_CAPACITY",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if message_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHATSYNC_MESSAGE_LIMIT",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            credential,
            session: SessionConfig {
                event_log_capacity,
                message_limit,
                refresh_delay_ms,
                name_pool,
            },
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is unset or blank.
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { key } => write!(f, "missing required {key}"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_name_pool(key: &'static str, value: &str) -> Result<Vec<String>, ConfigError> {
    let names: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect();
    if names.is_empty() {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
            reason: "must name at least one participant".to_owned(),
        });
    }
    Ok(names)
}

fn parse_optional_usize<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<usize>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use chatsync_core::{DEFAULT_EVENT_LOG_CAPACITY, DEFAULT_MESSAGE_LIMIT};

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<DemoConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        DemoConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_connection_string_and_defaults() {
        let cfg = config_from_pairs(&[(
            "CHATSYNC_CONNECTION_STRING",
            "endpoint=https://chat.example.org/;accesskey=c2VjcmV0",
        )])
        .expect("config should parse");

        assert_eq!(cfg.credential.endpoint(), Some("https://chat.example.org"));
        assert_eq!(cfg.session.event_log_capacity, DEFAULT_EVENT_LOG_CAPACITY);
        assert_eq!(cfg.session.message_limit, DEFAULT_MESSAGE_LIMIT);
        assert_eq!(cfg.session.refresh_delay_ms, 0);
        assert_eq!(cfg.session.name_pool, SessionConfig::default().name_pool);
    }

    #[test]
    fn connection_string_is_required() {
        let err = config_from_pairs(&[("CHATSYNC_CONNECTION_STRING", "   ")])
            .expect_err("blank credential should fail");
        assert_eq!(
            err,
            ConfigError::Missing {
                key: "CHATSYNC_CONNECTION_STRING"
            }
        );
    }

    #[test]
    fn malformed_connection_string_is_rejected_without_echoing_it() {
        let err = config_from_pairs(&[("CHATSYNC_CONNECTION_STRING", "endpoint=https://x")])
            .expect_err("missing access key should fail");
        let ConfigError::InvalidValue { key, value, .. } = err else {
            panic!("expected invalid value, got {err:?}");
        };
        assert_eq!(key, "CHATSYNC_CONNECTION_STRING");
        assert_eq!(value, "<redacted>");
    }

    #[test]
    fn parses_session_tuning_when_present() {
        let cfg = config_from_pairs(&[
            ("CHATSYNC_CONNECTION_STRING", "token"),
            ("CHATSYNC_EVENT_LOG_CAPACITY", "10"),
            ("CHATSYNC_MESSAGE_LIMIT", "25"),
            ("CHATSYNC_REFRESH_DELAY_MS", "250"),
            ("CHATSYNC_NAME_POOL", " Ann, ,Ben "),
        ])
        .expect("config should parse");

        assert_eq!(cfg.session.event_log_capacity, 10);
        assert_eq!(cfg.session.message_limit, 25);
        assert_eq!(cfg.session.refresh_delay_ms, 250);
        assert_eq!(cfg.session.name_pool, vec!["Ann".to_owned(), "Ben".to_owned()]);
    }

    #[test]
    fn rejects_unparseable_and_zero_limits() {
        let err = config_from_pairs(&[
            ("CHATSYNC_CONNECTION_STRING", "token"),
            ("CHATSYNC_MESSAGE_LIMIT", "lots"),
        ])
        .expect_err("non-numeric limit should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHATSYNC_MESSAGE_LIMIT",
                ..
            }
        ));

        let err = config_from_pairs(&[
            ("CHATSYNC_CONNECTION_STRING", "token"),
            ("CHATSYNC_EVENT_LOG_CAPACITY", "0"),
        ])
        .expect_err("zero capacity should fail");
        assert_eq!(
            err.to_string(),
            "invalid CHATSYNC_EVENT_LOG_CAPACITY='0': must be at least 1"
        );
    }

    #[test]
    fn name_pool_of_separators_only_is_rejected() {
        let err = config_from_pairs(&[
            ("CHATSYNC_CONNECTION_STRING", "token"),
            ("CHATSYNC_NAME_POOL", ",,"),
        ])
        .expect_err("empty pool should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHATSYNC_NAME_POOL",
                ..
            }
        ));
    }
}
