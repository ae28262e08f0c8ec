// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Primitives
//!
//! The runtime talks to the broker only through the traits in this module:
//! a `BrokerConnector` opens `BrokerConnection`s, a connection hands out
//! `BrokerChannel`s, and channels declare topology, publish, and subscribe.
//! The lapin backed implementation lives in [`crate::channel`].
//!
//! Deliveries are exposed as [`InboundMessage`], the raw message handle handlers
//! receive. Settlement (ack or reject) goes through a [`MessageAcker`] and is
//! guarded so each delivery is settled at most once.

use crate::{
    config::ConnectionSettings, consumer::ConsumerDefinition, errors::AmqpError,
    exchange::ExchangeDefinition, queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::debug;

/// Stream of deliveries produced by a subscription. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, AmqpError>>;

/// Opens connections from named settings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live connection. `reconnect` restores it in place so every holder of the
/// same handle observes the new transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn is_connected(&self) -> bool;

    async fn reconnect(&self) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// A channel: topology declarations, subscriptions and publications.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        def: &ConsumerDefinition,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Settles one delivery on the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageAcker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects without requeue.
    async fn reject(&self) -> Result<(), AmqpError>;
}

/// How a delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Rejected,
}

/// Message built by a publisher.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub headers: BTreeMap<ShortString, AMQPValue>,
    pub priority: u8,
    pub content_type: String,
    pub message_id: String,
}

impl OutboundMessage {
    /// Builds the AMQP properties carried with the body. Priority travels as a
    /// property, never as a header.
    pub fn properties(&self) -> AMQPProperties {
        AMQPProperties::default()
            .with_content_type(ShortString::from(self.content_type.clone()))
            .with_message_id(ShortString::from(self.message_id.clone()))
            .with_priority(self.priority)
            .with_headers(FieldTable::from(self.headers.clone()))
    }
}

/// Raw delivery handle given to handlers.
pub struct InboundMessage {
    pub body: Vec<u8>,
    pub properties: AMQPProperties,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    acker: Arc<dyn MessageAcker>,
    settled: AtomicBool,
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl InboundMessage {
    /// Wraps a delivery with the acker that settles it.
    pub fn new(
        body: Vec<u8>,
        properties: AMQPProperties,
        exchange: &str,
        routing_key: &str,
        delivery_tag: u64,
        acker: Arc<dyn MessageAcker>,
    ) -> Self {
        InboundMessage {
            body,
            properties,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            delivery_tag,
            acker,
            settled: AtomicBool::new(false),
        }
    }

    /// Raw message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Application headers, empty when the message carries none.
    pub fn headers(&self) -> BTreeMap<ShortString, AMQPValue> {
        self.properties
            .headers()
            .as_ref()
            .map(|h| h.inner().clone())
            .unwrap_or_default()
    }

    /// Priority property, when the publisher set one.
    pub fn priority(&self) -> Option<u8> {
        *self.properties.priority()
    }

    /// True once the delivery was acked or rejected.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Acks the delivery. Returns `false` when it had already been settled.
    pub async fn ack(&self) -> Result<bool, AmqpError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            debug!(delivery_tag = self.delivery_tag, "delivery already settled");
            return Ok(false);
        }
        self.acker.ack().await?;
        Ok(true)
    }

    /// Rejects the delivery without requeue. Returns `false` when it had
    /// already been settled.
    pub async fn reject(&self) -> Result<bool, AmqpError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            debug!(delivery_tag = self.delivery_tag, "delivery already settled");
            return Ok(false);
        }
        self.acker.reject().await?;
        Ok(true)
    }
}
