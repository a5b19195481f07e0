// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. an optional YAML file
//! 3. `LOGRELAY_*` environment variables (`LOGRELAY_FLUSH_INTERVAL_MS=500`)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::transport::{max_body_len, Destination};

pub const ENV_PREFIX: &str = "LOGRELAY_";

const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Host-local address every agent races to bind.
    pub local_address: String,
    /// Remote backend the owner relays to. Unset keeps logs on this host.
    pub remote_url: Option<String>,
    pub control_plane_url: Option<String>,
    pub environment_id: Option<String>,
    /// Proof of the signed-in user, used to mint ingestion credentials.
    pub session_token: Option<String>,
    /// A fixed ingestion token; skips minting when set.
    pub ingest_token: Option<String>,
    /// Owner storage directory. Unset keeps stored logs in memory.
    pub data_dir: Option<PathBuf>,
    /// Where minted credentials are persisted.
    pub state_dir: Option<PathBuf>,
    pub service_name: String,
    pub host_name: Option<String>,
    pub flush_interval_ms: u64,
    pub max_batch_events: usize,
    pub max_batch_bytes: usize,
    pub queue_capacity: usize,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub request_timeout_ms: u64,
    /// zstd level for ingest bodies; 0 disables compression.
    pub compression_level: i32,
    pub max_request_content_length: usize,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            local_address: constants::DEFAULT_LOCAL_ADDRESS.to_string(),
            remote_url: None,
            control_plane_url: None,
            environment_id: None,
            session_token: None,
            ingest_token: None,
            data_dir: None,
            state_dir: None,
            service_name: "logrelay-agent".to_string(),
            host_name: None,
            flush_interval_ms: millis(constants::DEFAULT_FLUSH_INTERVAL),
            max_batch_events: constants::DEFAULT_MAX_BATCH_EVENTS,
            max_batch_bytes: constants::DEFAULT_MAX_BATCH_BYTES,
            queue_capacity: constants::DEFAULT_QUEUE_CAPACITY,
            reconnect_base_ms: millis(constants::RECONNECT_BACKOFF_BASE),
            reconnect_cap_ms: millis(constants::RECONNECT_BACKOFF_CAP),
            request_timeout_ms: millis(constants::DEFAULT_REQUEST_TIMEOUT),
            compression_level: constants::DEFAULT_COMPRESSION_LEVEL,
            max_request_content_length: constants::DEFAULT_MAX_REQUEST_CONTENT_LENGTH,
            log_level: "info".to_string(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Loads and validates the configuration.
///
/// # Errors
///
/// [`ConfigError::Load`] if a source cannot be parsed, [`ConfigError::Invalid`]
/// if the merged result fails [`AgentConfig::validate`].
pub fn load(path: Option<&Path>) -> Result<AgentConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(AgentConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Yaml::file(path));
    }
    let config: AgentConfig = figment
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

impl AgentConfig {
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.local_address()?;

        for (field, value) in [
            ("flush_interval_ms", self.flush_interval_ms),
            ("reconnect_base_ms", self.reconnect_base_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(format!("{field} must be greater than zero")));
            }
        }
        for (field, value) in [
            ("max_batch_events", self.max_batch_events),
            ("max_batch_bytes", self.max_batch_bytes),
            ("queue_capacity", self.queue_capacity),
            ("max_request_content_length", self.max_request_content_length),
        ] {
            if value == 0 {
                return Err(invalid(format!("{field} must be greater than zero")));
            }
        }
        if self.reconnect_cap_ms < self.reconnect_base_ms {
            return Err(invalid(
                "reconnect_cap_ms must not be below reconnect_base_ms".to_string(),
            ));
        }
        if !(0..=22).contains(&self.compression_level) {
            return Err(invalid(format!(
                "compression_level {} is outside 0..=22",
                self.compression_level
            )));
        }
        let max_body = max_body_len(self.max_batch_bytes, self.compression_level);
        if max_body > self.max_request_content_length {
            return Err(invalid(format!(
                "max_batch_bytes {} can encode to {max_body} bytes, above max_request_content_length {}",
                self.max_batch_bytes, self.max_request_content_length
            )));
        }
        if let Some(url) = &self.remote_url {
            Destination::new(url).map_err(|err| invalid(format!("remote_url: {err}")))?;
        }
        match (&self.control_plane_url, &self.environment_id) {
            (Some(url), Some(_)) => {
                Destination::new(url)
                    .map_err(|err| invalid(format!("control_plane_url: {err}")))?;
            }
            (None, None) => {}
            _ => {
                return Err(invalid(
                    "control_plane_url and environment_id must be set together".to_string(),
                ))
            }
        }
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(invalid(format!("unknown log_level {}", self.log_level)));
        }
        Ok(())
    }

    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if `local_address` is not `ip:port`.
    pub fn local_address(&self) -> Result<SocketAddr, ConfigError> {
        self.local_address
            .parse()
            .map_err(|err| invalid(format!("local_address {}: {err}", self.local_address)))
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    #[must_use]
    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_in_jail(path: Option<&str>) -> Result<AgentConfig, ConfigError> {
        load(path.map(Path::new))
    }

    #[test]
    fn test_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();

            let config = load_in_jail(None).unwrap();
            assert_eq!(config, AgentConfig::default());
            assert_eq!(
                config.local_address().unwrap(),
                "127.0.0.1:7645".parse::<SocketAddr>().unwrap()
            );
            assert_eq!(config.flush_interval(), Duration::from_secs(1));
            Ok(())
        });
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "logrelay.yaml",
                r"
local_address: 127.0.0.1:9000
remote_url: https://logs.example.com
data_dir: /var/lib/logrelay
flush_interval_ms: 250
compression_level: 0
",
            )?;

            let config = load_in_jail(Some("logrelay.yaml")).unwrap();
            assert_eq!(config.local_address, "127.0.0.1:9000");
            assert_eq!(config.remote_url.as_deref(), Some("https://logs.example.com"));
            assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/logrelay")));
            assert_eq!(config.flush_interval(), Duration::from_millis(250));
            assert_eq!(config.compression_level, 0);
            assert_eq!(config.max_batch_events, 1000);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_yaml() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("logrelay.yaml", "flush_interval_ms: 250\nlog_level: warn\n")?;
            jail.set_env("LOGRELAY_FLUSH_INTERVAL_MS", "2000");
            jail.set_env("LOGRELAY_SERVICE_NAME", "checkout");

            let config = load_in_jail(Some("logrelay.yaml")).unwrap();
            assert_eq!(config.flush_interval_ms, 2000);
            assert_eq!(config.service_name, "checkout");
            assert_eq!(config.log_level, "warn");
            Ok(())
        });
    }

    #[test]
    fn test_missing_yaml_file_falls_back_to_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let config = load_in_jail(Some("absent.yaml")).unwrap();
            assert_eq!(config, AgentConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_malformed_value_is_a_load_error() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("LOGRELAY_QUEUE_CAPACITY", "lots");
            assert!(matches!(load_in_jail(None), Err(ConfigError::Load(_))));
            Ok(())
        });
    }

    #[test]
    fn test_validation_failures() {
        let cases: Vec<(&str, AgentConfig)> = vec![
            (
                "local_address",
                AgentConfig {
                    local_address: "localhost".to_string(),
                    ..AgentConfig::default()
                },
            ),
            (
                "flush_interval_ms",
                AgentConfig {
                    flush_interval_ms: 0,
                    ..AgentConfig::default()
                },
            ),
            (
                "queue_capacity",
                AgentConfig {
                    queue_capacity: 0,
                    ..AgentConfig::default()
                },
            ),
            (
                "reconnect_cap_ms",
                AgentConfig {
                    reconnect_base_ms: 5000,
                    reconnect_cap_ms: 100,
                    ..AgentConfig::default()
                },
            ),
            (
                "remote_url",
                AgentConfig {
                    remote_url: Some("not a url".to_string()),
                    ..AgentConfig::default()
                },
            ),
            (
                "together",
                AgentConfig {
                    control_plane_url: Some("https://cp.example.com".to_string()),
                    ..AgentConfig::default()
                },
            ),
            (
                "log_level",
                AgentConfig {
                    log_level: "chatty".to_string(),
                    ..AgentConfig::default()
                },
            ),
            (
                "compression_level",
                AgentConfig {
                    compression_level: 40,
                    ..AgentConfig::default()
                },
            ),
            (
                "max_batch_bytes",
                AgentConfig {
                    max_batch_bytes: 4096,
                    max_request_content_length: 4096,
                    ..AgentConfig::default()
                },
            ),
            (
                "max_batch_bytes",
                AgentConfig {
                    max_batch_bytes: 8192,
                    max_request_content_length: 4096,
                    compression_level: 0,
                    ..AgentConfig::default()
                },
            ),
        ];

        for (needle, config) in cases {
            match config.validate() {
                Err(ConfigError::Invalid(message)) => {
                    assert!(message.contains(needle), "{message} should mention {needle}");
                }
                other => panic!("expected {needle} to be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_batch_limit_fitting_the_request_limit_is_valid() {
        let uncompressed = AgentConfig {
            max_batch_bytes: 4096,
            max_request_content_length: 4096,
            compression_level: 0,
            ..AgentConfig::default()
        };
        assert!(uncompressed.validate().is_ok());
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_complete_control_plane_settings_are_valid() {
        let config = AgentConfig {
            control_plane_url: Some("https://cp.example.com".to_string()),
            environment_id: Some("env-1".to_string()),
            session_token: Some("session".to_string()),
            ..AgentConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
