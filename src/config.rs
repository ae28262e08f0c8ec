// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Runtime Configuration
//!
//! Typed view of the `rabbitmq` configuration file: the named connections, the
//! consumer configurators the scheduler launches, and the header names used to
//! propagate the tracer token.

use crate::{errors::AmqpError, logger::codes};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};
use tracing::debug;

/// Default name used when a caller does not ask for a specific connection.
pub const DEFAULT_CONNECTION_NAME: &str = "default";
/// Default tracer header.
pub const DEFAULT_TRACER_HEADER: &str = "tracer";
/// Mode in which every consumer runs as a single clone.
pub const MODE_HOMOL: &str = "homol";
/// Default heartbeat in seconds for non TLS connections.
pub const DEFAULT_HEARTBEAT: u16 = 10;
/// Default consumer lifetime in minutes.
pub const DEFAULT_LIFETIME_MINUTES: i64 = 240;

/// Settings of one named broker connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub ssl: bool,
    pub heartbeat: Option<u16>,
}

impl ConnectionSettings {
    /// Lists the required fields that are empty.
    pub fn violations(&self) -> Vec<String> {
        let mut violations = vec![];
        if self.host.is_empty() {
            violations.push("host is required".to_owned());
        }
        if self.port == 0 {
            violations.push("port is required".to_owned());
        }
        if self.user.is_empty() {
            violations.push("user is required".to_owned());
        }
        if self.password.is_empty() {
            violations.push("password is required".to_owned());
        }
        violations
    }

    /// Heartbeat in seconds, 10 unless configured.
    pub fn heartbeat(&self) -> u16 {
        self.heartbeat.unwrap_or(DEFAULT_HEARTBEAT)
    }
}

/// One consumer entry: which consumer runs with which handler, how many clones
/// and for how long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfigurator {
    pub consumer: String,
    pub handler: String,
    pub quantity: u32,
    /// Minutes
    pub lifetime: i64,
}

impl Default for ConsumerConfigurator {
    fn default() -> Self {
        ConsumerConfigurator {
            consumer: String::new(),
            handler: String::new(),
            quantity: 1,
            lifetime: DEFAULT_LIFETIME_MINUTES,
        }
    }
}

/// The whole `rabbitmq` configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfigs {
    pub default_connection: String,
    pub connections: BTreeMap<String, ConnectionSettings>,
    pub consumers: Vec<ConsumerConfigurator>,
    pub tracer_headers: Vec<String>,
    pub mode: String,
    pub app_name: String,
}

impl Default for RabbitMqConfigs {
    fn default() -> Self {
        RabbitMqConfigs {
            default_connection: DEFAULT_CONNECTION_NAME.to_owned(),
            connections: BTreeMap::default(),
            consumers: vec![],
            tracer_headers: vec![DEFAULT_TRACER_HEADER.to_owned()],
            mode: String::new(),
            app_name: "rabbitmq-runtime".to_owned(),
        }
    }
}

impl RabbitMqConfigs {
    /// Reads and parses a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, AmqpError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading rabbitmq configuration");

        let contents = fs::read_to_string(path).map_err(|err| {
            AmqpError::ConfigurationError(format!(
                "[{}] cannot read `{}`: {}",
                codes::PACKAGE_BAD_IMPLEMENTATION,
                path.display(),
                err
            ))
        })?;

        Self::from_toml(&contents)
    }

    /// Parses a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self, AmqpError> {
        toml::from_str::<RabbitMqConfigs>(contents).map_err(|err| {
            AmqpError::ConfigurationError(format!(
                "[{}] invalid rabbitmq configuration: {}",
                codes::PACKAGE_BAD_IMPLEMENTATION,
                err
            ))
        })
    }

    /// Package level requirements: at least one connection must exist.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.connections.is_empty() {
            return Err(AmqpError::ConfigurationError(format!(
                "[{}] you must configure at least one connection",
                codes::PACKAGE_BAD_IMPLEMENTATION
            )));
        }

        Ok(())
    }

    /// Header names carrying the tracer token, lower-cased. Falls back to
    /// `tracer` when none is configured.
    pub fn tracer_headers(&self) -> Vec<String> {
        let headers: Vec<String> = self
            .tracer_headers
            .iter()
            .map(|h| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect();

        if headers.is_empty() {
            return vec![DEFAULT_TRACER_HEADER.to_owned()];
        }
        headers
    }

    /// True in homologation mode, where every consumer runs a single clone.
    pub fn is_homol(&self) -> bool {
        self.mode == MODE_HOMOL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        default_connection = "main"
        tracer_headers = ["X-Tracer"]

        [connections.main]
        host = "localhost"
        port = 5672
        user = "guest"
        password = "guest"

        [connections.amazonmq]
        host = "mq.example.com"
        port = 5671
        user = "admin"
        password = "secret"
        ssl = true

        [[consumers]]
        consumer = "example"
        handler = "example"
        lifetime = 30
    "#;

    #[test]
    fn parses_toml_with_defaults() {
        let cfg = RabbitMqConfigs::from_toml(CONFIG).unwrap();

        assert_eq!(cfg.default_connection, "main");
        assert_eq!(cfg.connections.len(), 2);
        assert_eq!(cfg.connections["main"].heartbeat(), DEFAULT_HEARTBEAT);
        assert!(cfg.connections["amazonmq"].ssl);
        assert_eq!(cfg.consumers[0].quantity, 1);
        assert_eq!(cfg.consumers[0].lifetime, 30);
        assert_eq!(cfg.tracer_headers(), vec!["x-tracer".to_owned()]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_requires_a_connection() {
        let cfg = RabbitMqConfigs::default();

        assert!(matches!(
            cfg.validate(),
            Err(AmqpError::ConfigurationError(_))
        ));
    }

    #[test]
    fn connection_settings_report_every_missing_field() {
        let settings = ConnectionSettings {
            host: "localhost".to_owned(),
            ..Default::default()
        };

        assert_eq!(settings.violations().len(), 3);
    }

    #[test]
    fn invalid_toml_is_a_configuration_error() {
        assert!(matches!(
            RabbitMqConfigs::from_toml("connections = 3"),
            Err(AmqpError::ConfigurationError(_))
        ));
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = RabbitMqConfigs::from_file(dir.path().join("absent.toml"));

        assert!(matches!(result, Err(AmqpError::ConfigurationError(_))));
    }
}
