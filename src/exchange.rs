// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides the exchange declaration descriptor and the `Exchange`
//! component. An exchange owns its descriptor, borrows a channel from a
//! connection, and binds the payload type every message routed through it must
//! carry.

use crate::{
    broker::BrokerChannel,
    errors::AmqpError,
    logger::{codes, DEFAULT_LOG_PREFIX},
    payload::{attach_values, Payload, PayloadContract, PayloadMap},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    any::Any,
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error};

/// Constant for the argument used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    #[serde(rename = "x-delayed-message")]
    XMessageDelayed,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Declaration descriptor of an exchange.
///
/// `name` and `kind` are required. Every other field has the declare default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Option<ExchangeKind>,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub arguments: BTreeMap<String, Value>,
}

impl Default for ExchangeDefinition {
    fn default() -> Self {
        ExchangeDefinition {
            name: String::new(),
            kind: None,
            passive: false,
            durable: false,
            auto_delete: true,
            internal: false,
            no_wait: false,
            arguments: BTreeMap::default(),
        }
    }
}

impl ExchangeDefinition {
    /// Creates a new direct exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: Some(ExchangeKind::Direct),
            ..Default::default()
        }
    }

    /// Builds a definition from a string keyed map. Unknown keys are ignored.
    pub fn from_values(values: &PayloadMap) -> Result<ExchangeDefinition, AmqpError> {
        let mut def = ExchangeDefinition::default();
        attach_values(&mut def, values).map_err(|err| {
            AmqpError::ConfigurationError(format!(
                "[{}] invalid exchange values: {}",
                codes::EXCHANGE_BAD_IMPLEMENTATION,
                err
            ))
        })?;
        Ok(def)
    }

    /// Sets the routing kind.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Creates a delayed direct exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn direct_delayed(self) -> Self {
        self.delayed("direct")
    }

    /// Creates a delayed fanout exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn fanout_delayed(self) -> Self {
        self.delayed("fanout")
    }

    fn delayed(mut self, routing: &str) -> Self {
        self.kind = Some(ExchangeKind::XMessageDelayed);
        self.arguments.insert(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
            Value::String(routing.to_owned()),
        );
        self
    }

    /// Adds a declare argument.
    pub fn argument(mut self, key: &str, value: Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    /// Keeps the exchange when no queue is bound anymore.
    pub fn keep(mut self) -> Self {
        self.auto_delete = false;
        self
    }

    /// Keeps the exchange across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Only checks that the exchange exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Required fields that are missing.
    pub fn violations(&self) -> Vec<String> {
        let mut violations = vec![];
        if self.name.trim().is_empty() {
            violations.push("exchange name is required".to_owned());
        }
        if self.kind.is_none() {
            violations.push("exchange type is required".to_owned());
        }
        violations
    }
}

/// A named exchange bound to a channel and to a payload contract.
pub struct Exchange {
    channel: Arc<dyn BrokerChannel>,
    definition: Option<ExchangeDefinition>,
    payload: Option<PayloadContract>,
    log_prefix: String,
    closed: AtomicBool,
}

/// Builds an exchange on a given channel.
pub type ExchangeFactory = Arc<dyn Fn(Arc<dyn BrokerChannel>) -> Exchange + Send + Sync>;

impl Exchange {
    /// Creates an unconfigured exchange on `channel`.
    ///
    /// # Parameters
    /// * `channel` - Channel the exchange declares on and closes
    ///
    /// # Returns
    /// An exchange with the default log prefix and no payload contract
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Exchange {
        Exchange {
            channel,
            definition: None,
            payload: None,
            log_prefix: DEFAULT_LOG_PREFIX.to_owned(),
            closed: AtomicBool::new(false),
        }
    }

    /// Stores the descriptor. No side effects.
    pub fn configure(mut self, definition: ExchangeDefinition) -> Self {
        self.definition = Some(definition);
        self
    }

    /// Binds the payload contract.
    pub fn payload<P: Payload>(mut self) -> Self {
        self.payload = Some(PayloadContract::of::<P>());
        self
    }

    /// Prefix of the log tokens written for this exchange.
    pub fn log_prefix(mut self, prefix: &str) -> Self {
        self.log_prefix = prefix.to_owned();
        self
    }

    pub fn get_log_prefix(&self) -> &str {
        &self.log_prefix
    }

    /// Channel owned by the exchange.
    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    /// Every reason the exchange cannot be declared, empty when valid.
    pub fn violations(&self) -> Vec<String> {
        let mut violations = match &self.definition {
            None => vec!["exchange must be configured".to_owned()],
            Some(def) => def.violations(),
        };
        if self.payload.is_none() {
            violations.push("exchange payload contract must be bound".to_owned());
        }
        violations
    }

    fn validate(&self) -> Result<&ExchangeDefinition, AmqpError> {
        let violations = self.violations();
        match &self.definition {
            Some(def) if violations.is_empty() => Ok(def),
            _ => Err(AmqpError::ConfigurationError(format!(
                "[{}] {}",
                codes::EXCHANGE_BAD_IMPLEMENTATION,
                violations.join(", ")
            ))),
        }
    }

    /// Validates the configuration and declares the exchange.
    pub async fn create(&self) -> Result<(), AmqpError> {
        let def = self.validate()?;

        debug!("creating exchange: {}", def.name);
        if let Err(err) = self.channel.exchange_declare(def).await {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the exchange"
            );
            return Err(err);
        }
        debug!("exchange: {} was created", def.name);

        Ok(())
    }

    /// Exchange name. Fails when the exchange is not validly configured.
    pub fn name(&self) -> Result<&str, AmqpError> {
        Ok(&self.validate()?.name)
    }

    /// Validated descriptor.
    pub fn definition(&self) -> Result<&ExchangeDefinition, AmqpError> {
        self.validate()
    }

    /// Bound payload contract.
    pub fn payload_contract(&self) -> Result<PayloadContract, AmqpError> {
        self.validate()?;
        self.payload.ok_or_else(|| {
            AmqpError::ConfigurationError(format!(
                "[{}] exchange payload contract must be bound",
                codes::EXCHANGE_BAD_IMPLEMENTATION
            ))
        })
    }

    /// Fails when `value` is not an instance of the bound payload type.
    pub fn validate_payload_instance(&self, value: &dyn Any) -> Result<(), AmqpError> {
        let contract = self.payload_contract()?;
        if contract.is_instance(value) {
            return Ok(());
        }

        Err(AmqpError::HandlerMismatchError(format!(
            "[{}] payload must be of the exchange payload type `{}`",
            codes::CONSUMER_HANDLER_BAD_IMPLEMENTATION,
            contract.name()
        )))
    }

    /// Fails when `contract` is not the bound payload contract.
    pub fn validate_payload_contract(&self, contract: &PayloadContract) -> Result<(), AmqpError> {
        let bound = self.payload_contract()?;
        if bound == *contract {
            return Ok(());
        }

        Err(AmqpError::HandlerMismatchError(format!(
            "[{}] handler payload `{}` does not match the exchange payload `{}`",
            codes::CONSUMER_HANDLER_BAD_IMPLEMENTATION,
            contract.name(),
            bound.name()
        )))
    }

    /// Closes the channel. Only the first call reaches the broker.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel.close().await
    }
}
