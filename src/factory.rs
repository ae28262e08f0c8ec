// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer and Handler Registry
//!
//! Configuration names consumers and handlers by symbolic ids. The
//! `ConsumerFactory` maps every id to a builder registered by the application
//! at process start, and fails fast on ids nobody registered.

use crate::{
    channel::LapinConnector,
    config::RabbitMqConfigs,
    connection::ConnectionRegistry,
    consumer::Consumer,
    errors::AmqpError,
    handler::DynHandler,
    logger::codes,
    payload::PayloadMap,
    tracer::TracerState,
};
use std::{collections::BTreeMap, sync::Arc};

/// Shared runtime state handed to every builder.
#[derive(Clone)]
pub struct RuntimeContext {
    pub registry: Arc<ConnectionRegistry>,
    pub tracer: Arc<TracerState>,
}

impl RuntimeContext {
    /// Context over an existing registry and tracer.
    pub fn new(registry: Arc<ConnectionRegistry>, tracer: Arc<TracerState>) -> Self {
        RuntimeContext { registry, tracer }
    }

    /// Validates the configuration and wires a lapin backed registry.
    pub fn from_configs(configs: RabbitMqConfigs) -> Result<Self, AmqpError> {
        configs.validate()?;

        let tracer = Arc::new(TracerState::new(configs.tracer_headers()));
        let connector = Arc::new(LapinConnector::new(&configs.app_name));
        let registry = Arc::new(ConnectionRegistry::new(Some(configs), connector));

        Ok(RuntimeContext { registry, tracer })
    }
}

/// Builds a consumer from the context and the cached launch payload.
pub type ConsumerBuilder =
    Arc<dyn Fn(&RuntimeContext, &PayloadMap) -> Result<Consumer, AmqpError> + Send + Sync>;

/// Builds a handler from the context.
pub type HandlerBuilder = Arc<dyn Fn(&RuntimeContext) -> Arc<dyn DynHandler> + Send + Sync>;

/// Maps consumer and handler ids to their builders.
///
/// Ids are the names used in the configured consumer list and on the command line.
#[derive(Clone, Default)]
pub struct ConsumerFactory {
    consumers: BTreeMap<String, ConsumerBuilder>,
    handlers: BTreeMap<String, HandlerBuilder>,
}

impl ConsumerFactory {
    pub fn new() -> Self {
        ConsumerFactory::default()
    }

    /// Registers the consumer built under `id`, replacing any previous one.
    pub fn register_consumer<F>(mut self, id: &str, builder: F) -> Self
    where
        F: Fn(&RuntimeContext, &PayloadMap) -> Result<Consumer, AmqpError> + Send + Sync + 'static,
    {
        self.consumers.insert(id.to_owned(), Arc::new(builder));
        self
    }

    /// Registers the handler built under `id`, replacing any previous one.
    pub fn register_handler<F>(mut self, id: &str, builder: F) -> Self
    where
        F: Fn(&RuntimeContext) -> Arc<dyn DynHandler> + Send + Sync + 'static,
    {
        self.handlers.insert(id.to_owned(), Arc::new(builder));
        self
    }

    /// True when a consumer is registered under `id`.
    pub fn has_consumer(&self, id: &str) -> bool {
        self.consumers.contains_key(id)
    }

    pub fn has_handler(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    /// Builds the consumer registered under `id`.
    ///
    /// # Parameters
    /// * `id` - Registered consumer id
    /// * `ctx` - Registry and tracer shared by the process
    /// * `payload` - Launch payload, empty when none was cached
    ///
    /// # Returns
    /// The consumer, or `ConfigurationError` (`QUE-009`) for an unknown id
    pub fn consumer(
        &self,
        id: &str,
        ctx: &RuntimeContext,
        payload: &PayloadMap,
    ) -> Result<Consumer, AmqpError> {
        match self.consumers.get(id) {
            Some(builder) => builder(ctx, payload),
            None => Err(AmqpError::ConfigurationError(format!(
                "[{}] consumer `{}` not found",
                codes::CONSUMER_RAISER_BAD_IMPLEMENTATION,
                id
            ))),
        }
    }

    /// Builds the handler registered under `id`.
    pub fn handler(&self, id: &str, ctx: &RuntimeContext) -> Result<Arc<dyn DynHandler>, AmqpError> {
        match self.handlers.get(id) {
            Some(builder) => Ok(builder(ctx)),
            None => Err(AmqpError::ConfigurationError(format!(
                "[{}] consumer handler `{}` not found",
                codes::CONSUMER_RAISER_BAD_IMPLEMENTATION,
                id
            ))),
        }
    }

    /// Checks every configured consumer entry against the registered ids.
    pub fn validate(&self, configs: &RabbitMqConfigs) -> Result<(), AmqpError> {
        for entry in &configs.consumers {
            if !self.has_consumer(&entry.consumer) {
                return Err(AmqpError::ConfigurationError(format!(
                    "[{}] consumer `{}` is configured but not registered",
                    codes::PACKAGE_BAD_IMPLEMENTATION,
                    entry.consumer
                )));
            }
            if !self.has_handler(&entry.handler) {
                return Err(AmqpError::ConfigurationError(format!(
                    "[{}] consumer handler `{}` is configured but not registered",
                    codes::PACKAGE_BAD_IMPLEMENTATION,
                    entry.handler
                )));
            }
        }

        Ok(())
    }
}
