// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Registry
//!
//! Owns the named broker connections of the process. Connections are opened
//! lazily, reused by every caller asking for the same name, reconnected in place
//! when found disconnected, and closed together by `shutdown_all`.
//!
//! The registry is an explicit value injected into queues, consumers and
//! publishers rather than process global state.

use crate::{
    broker::{BrokerConnection, BrokerConnector},
    config::RabbitMqConfigs,
    errors::AmqpError,
    logger::codes,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Process registry of named broker connections.
///
/// Shared through an `Arc` by queues, consumers and publishers.
pub struct ConnectionRegistry {
    configs: Option<RabbitMqConfigs>,
    connector: Arc<dyn BrokerConnector>,
    connections: Mutex<HashMap<String, Arc<dyn BrokerConnection>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    ///
    /// # Parameters
    /// * `configs` - Topology configuration, `None` makes every lookup fail
    /// * `connector` - Opens the connections on first use
    ///
    /// # Returns
    /// A registry with no open connection
    pub fn new(configs: Option<RabbitMqConfigs>, connector: Arc<dyn BrokerConnector>) -> Self {
        ConnectionRegistry {
            configs,
            connector,
            connections: Mutex::new(HashMap::default()),
        }
    }

    /// Configuration the registry resolves names against.
    pub fn configs(&self) -> Option<&RabbitMqConfigs> {
        self.configs.as_ref()
    }

    /// Resolves the connection name and checks its settings.
    fn validate(&self, name: Option<&str>) -> Result<(String, &RabbitMqConfigs), AmqpError> {
        let Some(configs) = &self.configs else {
            return Err(AmqpError::ConfigurationError(format!(
                "[{}] you must provide a rabbitmq configuration",
                codes::CONNECTION_BAD_IMPLEMENTATION
            )));
        };

        let name = name.unwrap_or(&configs.default_connection).to_owned();

        let Some(settings) = configs.connections.get(&name) else {
            return Err(AmqpError::ConfigurationError(format!(
                "[{}] connection `{}` is not configured",
                codes::CONNECTION_BAD_IMPLEMENTATION,
                name
            )));
        };

        let violations = settings.violations();
        if !violations.is_empty() {
            return Err(AmqpError::ConfigurationError(format!(
                "[{}] connection `{}`: {}",
                codes::CONNECTION_BAD_IMPLEMENTATION,
                name,
                violations.join(", ")
            )));
        }

        Ok((name, configs))
    }

    /// Returns the named connection, or the default one when `name` is `None`.
    pub async fn connection(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let (name, configs) = self.validate(name)?;

        let mut connections = self.connections.lock().await;

        if let Some(connection) = connections.get(&name) {
            if !connection.is_connected().await {
                warn!(name = name, "connection lost, reconnecting");
                connection.reconnect().await?;
            }
            return Ok(connection.clone());
        }

        debug!(name = name, "opening connection");
        let settings = &configs.connections[&name];
        let connection = self.connector.connect(&name, settings).await?;
        connections.insert(name, connection.clone());

        Ok(connection)
    }

    /// Number of cached connections.
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// True when no connection is cached.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes every open connection and clears the registry. Safe to call
    /// repeatedly.
    pub async fn shutdown_all(&self) {
        let mut connections = self.connections.lock().await;

        for (name, connection) in connections.drain() {
            if !connection.is_connected().await {
                continue;
            }
            if let Err(err) = connection.close().await {
                error!(error = err.to_string(), name = name, "failure to close connection");
            }
        }
    }
}
