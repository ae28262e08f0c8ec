// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides the queue declaration descriptor and the `Queue`
//! component. A queue lazily takes a channel from the connection registry,
//! instantiates its exchange on that channel, and on `create` declares itself,
//! declares the exchange, and binds the two with the configured routing key.

use crate::{
    broker::BrokerChannel,
    connection::ConnectionRegistry,
    errors::AmqpError,
    exchange::{Exchange, ExchangeFactory},
    logger::codes,
    payload::{attach_values, PayloadMap},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Declaration descriptor of a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDefinition {
    pub name: String,
    pub routing_key: String,
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
    pub arguments: BTreeMap<String, Value>,
    pub ttl: Option<i32>,
    pub max_length: Option<i32>,
    pub max_length_bytes: Option<i32>,
}

impl Default for QueueDefinition {
    fn default() -> Self {
        QueueDefinition {
            name: String::new(),
            routing_key: String::new(),
            passive: false,
            durable: false,
            exclusive: false,
            auto_delete: true,
            no_wait: false,
            arguments: BTreeMap::default(),
            ttl: None,
            max_length: None,
            max_length_bytes: None,
        }
    }
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name and an empty routing key.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Builds a definition from a string keyed map. Unknown keys are ignored.
    pub fn from_values(values: &PayloadMap) -> Result<QueueDefinition, AmqpError> {
        let mut def = QueueDefinition::default();
        attach_values(&mut def, values).map_err(|err| {
            AmqpError::ConfigurationError(format!(
                "[{}] invalid queue values: {}",
                codes::QUEUE_BAD_IMPLEMENTATION,
                err
            ))
        })?;
        Ok(def)
    }

    /// Binding key used against the exchange.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Keeps the queue when its last consumer goes away.
    pub fn keep(mut self) -> Self {
        self.auto_delete = false;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Adds a declare argument.
    pub fn argument(mut self, key: &str, value: Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Declare arguments: the free form ones plus ttl and length limits.
    pub fn declare_arguments(&self) -> BTreeMap<String, Value> {
        let mut args = self.arguments.clone();

        if let Some(ttl) = self.ttl {
            args.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), Value::from(ttl));
        }
        if let Some(max) = self.max_length {
            args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), Value::from(max));
        }
        if let Some(max) = self.max_length_bytes {
            args.insert(AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(), Value::from(max));
        }

        args
    }

    /// Every reason the queue cannot be declared, empty when valid.
    pub fn violations(&self) -> Vec<String> {
        if self.name.trim().is_empty() {
            return vec!["queue name is required".to_owned()];
        }
        vec![]
    }
}

/// A named queue bound to its exchange.
pub struct Queue {
    registry: Arc<ConnectionRegistry>,
    connection_name: Option<String>,
    definition: Option<QueueDefinition>,
    exchange_factory: Option<ExchangeFactory>,
    channel: Option<Arc<dyn BrokerChannel>>,
    exchange: Option<Exchange>,
}

impl Queue {
    /// Creates an unconfigured queue.
    ///
    /// # Parameters
    /// * `registry` - Connections the queue opens its channel on
    ///
    /// # Returns
    /// A queue on the default connection
    pub fn new(registry: Arc<ConnectionRegistry>) -> Queue {
        Queue {
            registry,
            connection_name: None,
            definition: None,
            exchange_factory: None,
            channel: None,
            exchange: None,
        }
    }

    /// Stores the descriptor. No side effects.
    pub fn configure(mut self, definition: QueueDefinition) -> Self {
        self.definition = Some(definition);
        self
    }

    /// Sets the exchange the queue binds to.
    pub fn exchange_factory(mut self, factory: ExchangeFactory) -> Self {
        self.exchange_factory = Some(factory);
        self
    }

    /// Targets a named connection instead of the default one.
    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    fn validate(&self) -> Result<&QueueDefinition, AmqpError> {
        match &self.definition {
            Some(def) if def.violations().is_empty() => Ok(def),
            _ => Err(AmqpError::ConfigurationError(format!(
                "[{}] you must configure your queue",
                codes::QUEUE_BAD_IMPLEMENTATION
            ))),
        }
    }

    /// Queue name. Fails when the queue is not validly configured.
    pub fn name(&self) -> Result<&str, AmqpError> {
        Ok(&self.validate()?.name)
    }

    pub fn definition(&self) -> Result<&QueueDefinition, AmqpError> {
        self.validate()
    }

    /// Channel taken from the registry on first use.
    pub async fn channel(&mut self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if let Some(channel) = &self.channel {
            return Ok(channel.clone());
        }

        let connection = self
            .registry
            .connection(self.connection_name.as_deref())
            .await?;
        let channel = connection.channel().await?;
        self.channel = Some(channel.clone());

        Ok(channel)
    }

    /// Exchange instantiated on the queue's channel on first use.
    pub async fn exchange(&mut self) -> Result<&Exchange, AmqpError> {
        if self.exchange.is_none() {
            let Some(factory) = self.exchange_factory.clone() else {
                return Err(AmqpError::ConfigurationError(format!(
                    "[{}] the queue exchange is not set",
                    codes::EXCHANGE_BAD_IMPLEMENTATION
                )));
            };

            let channel = self.channel().await?;
            self.exchange = Some(factory(channel));
        }

        self.exchange.as_ref().ok_or_else(|| {
            AmqpError::ConfigurationError(format!(
                "[{}] the queue exchange is not set",
                codes::EXCHANGE_BAD_IMPLEMENTATION
            ))
        })
    }

    /// Declares the queue and its exchange, then binds them.
    pub async fn create(&mut self) -> Result<(), AmqpError> {
        let def = self.validate()?.clone();
        if self.exchange_factory.is_none() {
            return Err(AmqpError::ConfigurationError(format!(
                "[{}] the queue exchange is not set",
                codes::EXCHANGE_BAD_IMPLEMENTATION
            )));
        }

        let channel = self.channel().await?;
        let exchange = self.exchange().await?;
        let exchange_name = exchange.name()?.to_owned();

        debug!("creating queue: {}", def.name);
        if let Err(err) = channel.queue_declare(&def).await {
            error!(error = err.to_string(), name = def.name, "error to declare the queue");
            return Err(err);
        }
        debug!("queue: {} was created", def.name);

        exchange.create().await?;

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            def.name, exchange_name, def.routing_key
        );
        if let Err(err) = channel
            .queue_bind(&def.name, &exchange_name, &def.routing_key)
            .await
        {
            error!(error = err.to_string(), "error to bind queue to exchange");
            return Err(err);
        }

        Ok(())
    }

    /// Closes the queue's channel through its exchange, which owns the close guard.
    pub async fn close(&mut self) -> Result<(), AmqpError> {
        match &self.exchange {
            Some(exchange) => exchange.close().await,
            None => match self.channel.take() {
                Some(channel) => channel.close().await,
                None => Ok(()),
            },
        }
    }
}
