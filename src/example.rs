// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Example Topology
//!
//! A complete `example` wiring: a direct exchange carrying [`ExamplePayload`],
//! the `example` queue bound to it, a consumer, a handler that acks, and a
//! publisher. Applications copy this shape for their own topologies.

use crate::{
    broker::InboundMessage,
    config::ConsumerConfigurator,
    connection::ConnectionRegistry,
    consumer::{Consumer, ConsumerDefinition},
    errors::AmqpError,
    exchange::{Exchange, ExchangeDefinition, ExchangeFactory},
    factory::{ConsumerFactory, RuntimeContext},
    handler::Handler,
    payload::Payload,
    publisher::Publisher,
    queue::{Queue, QueueDefinition},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Id under which the example consumer and handler are registered.
pub const EXAMPLE_ID: &str = "example";

/// Payload of the `example` exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExamplePayload {
    pub test: String,
}

impl Default for ExamplePayload {
    fn default() -> Self {
        ExamplePayload {
            test: "test".to_owned(),
        }
    }
}

impl Payload for ExamplePayload {}

/// Direct `example` exchange carrying [`ExamplePayload`].
pub fn example_exchange() -> ExchangeFactory {
    Arc::new(|channel| {
        Exchange::new(channel)
            .configure(ExchangeDefinition::new("example").direct())
            .payload::<ExamplePayload>()
            .log_prefix("EXAMPLE")
    })
}

/// `example` queue bound to [`example_exchange`].
pub fn example_queue(registry: Arc<ConnectionRegistry>) -> Queue {
    Queue::new(registry)
        .configure(QueueDefinition::new("example"))
        .exchange_factory(example_exchange())
}

/// Consumer of the `example` queue, tagged `exemplo_*`.
pub fn example_consumer(ctx: &RuntimeContext) -> Consumer {
    Consumer::new(
        example_queue(ctx.registry.clone()),
        ctx.registry.clone(),
        ctx.tracer.clone(),
    )
    .configure(ConsumerDefinition::new("exemplo"))
}

/// Publisher to the `example` exchange.
pub fn example_publisher(ctx: &RuntimeContext) -> Publisher {
    Publisher::new(ctx.registry.clone(), ctx.tracer.clone()).exchange_factory(example_exchange())
}

/// Logs the payload and acks.
pub struct ExampleHandler;

#[async_trait]
impl Handler for ExampleHandler {
    type Payload = ExamplePayload;

    async fn handle(
        &self,
        payload: ExamplePayload,
        message: &InboundMessage,
    ) -> Result<(), AmqpError> {
        info!(
            test = %payload.test,
            delivery_tag = message.delivery_tag,
            "example message received"
        );

        message.ack().await?;
        Ok(())
    }
}

/// One clone of the example consumer living 30 minutes.
pub fn example_configurator() -> ConsumerConfigurator {
    ConsumerConfigurator {
        consumer: EXAMPLE_ID.to_owned(),
        handler: EXAMPLE_ID.to_owned(),
        quantity: 1,
        lifetime: 30,
    }
}

/// Registers the example consumer and handler.
pub fn register(factory: ConsumerFactory) -> ConsumerFactory {
    factory
        .register_consumer(EXAMPLE_ID, |ctx, _| Ok(example_consumer(ctx)))
        .register_handler(EXAMPLE_ID, |_| Arc::new(ExampleHandler))
}
