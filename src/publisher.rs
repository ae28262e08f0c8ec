// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! A publisher sends one message per call to its exchange. The exchange is
//! declared lazily on a channel of the target connection and declared again on a
//! fresh channel whenever the cached one reports closed.
//!
//! Every message carries the tracer token header and the current OpenTelemetry
//! context. A configured delay adds the `x-delay` header read by delayed
//! exchanges. Priority travels as a message property.

use crate::{
    broker::OutboundMessage,
    connection::ConnectionRegistry,
    errors::AmqpError,
    exchange::{Exchange, ExchangeFactory},
    logger::{codes, QueueLogger},
    otel,
    payload::Payload,
    tracer::TracerState,
};
use lapin::types::{AMQPValue, ShortString};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header read by delayed exchanges, in milliseconds.
pub const AMQP_HEADERS_DELAY: &str = "x-delay";

/// Sends payloads to one exchange.
///
/// The exchange is built from an [`ExchangeFactory`] on a channel of the
/// target connection. Call [`Publisher::close`] when done so the channel is
/// released before the connection shuts down.
pub struct Publisher {
    registry: Arc<ConnectionRegistry>,
    tracer: Arc<TracerState>,
    exchange_factory: Option<ExchangeFactory>,
    exchange: Option<Exchange>,
    connection_name: Option<String>,
    delay: i64,
}

impl Publisher {
    /// Creates a publisher without an exchange.
    ///
    /// # Parameters
    /// * `registry` - Connections the publisher opens its channel on
    /// * `tracer` - Tracer state injected into every message
    ///
    /// # Returns
    /// A publisher on the default connection with no delay
    pub fn new(registry: Arc<ConnectionRegistry>, tracer: Arc<TracerState>) -> Self {
        Publisher {
            registry,
            tracer,
            exchange_factory: None,
            exchange: None,
            connection_name: None,
            delay: 0,
        }
    }

    /// Sets the exchange the publisher sends to.
    pub fn exchange_factory(mut self, factory: ExchangeFactory) -> Self {
        self.exchange_factory = Some(factory);
        self
    }

    /// Delay in milliseconds. Zero or less publishes immediately.
    pub fn set_delay(&mut self, delay: i64) -> &mut Self {
        self.delay = delay;
        self
    }

    /// Delay in milliseconds applied to the next publish.
    pub fn get_delay(&self) -> i64 {
        self.delay
    }

    /// Targets a named connection. Closes the cached exchange so the next
    /// publish opens a channel on the new connection.
    pub async fn set_connection_name(&mut self, name: &str) -> &mut Self {
        self.connection_name = Some(name.to_owned());
        if let Err(err) = self.close().await {
            warn!(error = err.to_string(), "failure to close the publisher channel");
        }
        self
    }

    /// `None` means the registry's default connection.
    pub fn get_connection_name(&self) -> Option<&str> {
        self.connection_name.as_deref()
    }

    /// Closes the channel of the cached exchange, if any. The next publish
    /// opens a new one.
    pub async fn close(&mut self) -> Result<(), AmqpError> {
        match self.exchange.take() {
            Some(exchange) if exchange.channel().is_open() => exchange.close().await,
            _ => Ok(()),
        }
    }

    /// Cached exchange, rebuilt and declared on a new channel when the cached
    /// channel is closed.
    async fn exchange(&mut self) -> Result<&Exchange, AmqpError> {
        let Some(factory) = self.exchange_factory.clone() else {
            return Err(AmqpError::ConfigurationError(format!(
                "[{}] the publisher exchange is not set",
                codes::PUBLISHER_BAD_IMPLEMENTATION
            )));
        };

        let stale = match &self.exchange {
            Some(exchange) => !exchange.channel().is_open(),
            None => true,
        };

        if stale {
            debug!("opening publisher channel");
            let connection = self
                .registry
                .connection(self.connection_name.as_deref())
                .await?;
            let channel = connection.channel().await?;
            let exchange = factory(channel);
            exchange.create().await?;
            self.exchange = Some(exchange);
        }

        self.exchange.as_ref().ok_or_else(|| {
            AmqpError::ConfigurationError(format!(
                "[{}] the publisher exchange is not set",
                codes::PUBLISHER_BAD_IMPLEMENTATION
            ))
        })
    }

    /// Wire message for `payload`: JSON body, tracer and trace context headers,
    /// the delay header when a delay is set, and the priority property.
    pub fn build_message<P: Payload>(
        &self,
        payload: &P,
        priority: u8,
    ) -> Result<OutboundMessage, AmqpError> {
        let body = payload.encode()?;

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(&mut headers);
        self.tracer.inject(&mut headers);

        if self.delay > 0 {
            headers.insert(
                ShortString::from(AMQP_HEADERS_DELAY),
                AMQPValue::LongLongInt(self.delay),
            );
        }

        Ok(OutboundMessage {
            body,
            headers,
            priority,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_id: Uuid::new_v4().to_string(),
        })
    }

    /// Publishes `payload` to the exchange. Fails with `HandlerMismatchError`
    /// when `payload` is not the exchange's payload type.
    pub async fn publish<P: Payload>(
        &mut self,
        payload: &P,
        priority: u8,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let message = self.build_message(payload, priority)?;
        let exchange = self.exchange().await?;

        exchange.validate_payload_instance(payload)?;
        let name = exchange.name()?.to_owned();
        let logger = QueueLogger::new(exchange.get_log_prefix());

        if let Err(err) = exchange
            .channel()
            .basic_publish(&name, routing_key, &message)
            .await
        {
            error!(error = err.to_string(), "error publishing message");
            return Err(err);
        }

        logger.info(
            codes::PUBLISHER_PUBLISHED_MESSAGE,
            json!({
                "title": "Publisher published message",
                "exchange": name,
                "routing_key": routing_key,
                "message_id": message.message_id,
            }),
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exchange::ExchangeDefinition,
        testing::{FakeBroker, FakeCall},
        tracer::TRACE_NOT_IMPLEMENTED,
    };
    use lapin::types::LongString;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Notice {
        text: String,
    }

    impl Payload for Notice {}

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Stranger {
        text: String,
    }

    impl Payload for Stranger {}

    /// Serializes itself as an envelope instead of its plain fields.
    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Enveloped {
        text: String,
    }

    impl Payload for Enveloped {
        fn encode(&self) -> Result<Vec<u8>, AmqpError> {
            serde_json::to_vec(&serde_json::json!({"v": 2, "data": {"text": self.text}}))
                .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
        }
    }

    fn notices() -> ExchangeFactory {
        Arc::new(|channel| {
            Exchange::new(channel)
                .configure(ExchangeDefinition::new("notices").direct_delayed())
                .payload::<Notice>()
                .log_prefix("NOTICES")
        })
    }

    fn publisher(broker: &FakeBroker, tracer: Arc<TracerState>) -> Publisher {
        Publisher::new(broker.registry(), tracer).exchange_factory(notices())
    }

    fn published(broker: &FakeBroker) -> Vec<OutboundMessage> {
        broker
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                FakeCall::Publish { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn notice(text: &str) -> Notice {
        Notice {
            text: text.to_owned(),
        }
    }

    #[tokio::test]
    async fn delay_header_only_when_positive() {
        let broker = FakeBroker::new();
        let mut publisher = publisher(&broker, Arc::new(TracerState::default()));

        publisher.publish(&notice("now"), 0, "").await.unwrap();
        publisher.set_delay(5000);
        publisher.publish(&notice("later"), 0, "").await.unwrap();

        let messages = published(&broker);
        assert!(!messages[0]
            .headers
            .contains_key(&ShortString::from(AMQP_HEADERS_DELAY)));
        assert_eq!(
            messages[1].headers.get(&ShortString::from(AMQP_HEADERS_DELAY)),
            Some(&AMQPValue::LongLongInt(5000))
        );
    }

    #[tokio::test]
    async fn message_carries_body_tracer_and_priority() {
        let broker = FakeBroker::new();
        let tracer = Arc::new(TracerState::default());
        tracer.set("T-7");
        let mut publisher = publisher(&broker, tracer);

        publisher.publish(&notice("hello"), 1, "rk").await.unwrap();

        let message = &published(&broker)[0];
        assert_eq!(message.body, br#"{"text":"hello"}"#.to_vec());
        assert_eq!(message.priority, 1);
        assert_eq!(message.content_type, JSON_CONTENT_TYPE);
        assert_eq!(
            message.headers.get(&ShortString::from("tracer")),
            Some(&AMQPValue::LongString(LongString::from("T-7")))
        );
        assert!(!message.headers.contains_key(&ShortString::from("priority")));
        assert!(broker.calls().contains(&FakeCall::Publish {
            exchange: "notices".to_owned(),
            routing_key: "rk".to_owned(),
            message: message.clone(),
        }));
    }

    #[tokio::test]
    async fn payload_own_encoding_is_the_body() {
        let broker = FakeBroker::new();
        let mut publisher = Publisher::new(broker.registry(), Arc::new(TracerState::default()))
            .exchange_factory(Arc::new(|channel| {
                Exchange::new(channel)
                    .configure(ExchangeDefinition::new("envelopes").direct())
                    .payload::<Enveloped>()
            }));
        let payload = Enveloped {
            text: "hello".to_owned(),
        };

        publisher.publish(&payload, 0, "").await.unwrap();

        let message = &published(&broker)[0];
        assert_eq!(message.body, payload.encode().unwrap());
        assert_eq!(message.body, br#"{"data":{"text":"hello"},"v":2}"#.to_vec());
    }

    #[tokio::test]
    async fn sentinel_token_is_replaced() {
        let broker = FakeBroker::new();
        let tracer = Arc::new(TracerState::default());
        tracer.set(TRACE_NOT_IMPLEMENTED);
        let mut publisher = publisher(&broker, tracer);

        publisher.publish(&notice("x"), 0, "").await.unwrap();

        let token = published(&broker)[0]
            .headers
            .get(&ShortString::from("tracer"))
            .cloned();
        assert!(matches!(token, Some(AMQPValue::LongString(t)) if !t.as_bytes().is_empty() && t.as_bytes() != TRACE_NOT_IMPLEMENTED.as_bytes()));
    }

    #[tokio::test]
    async fn foreign_payload_is_a_mismatch() {
        let broker = FakeBroker::new();
        let mut publisher = publisher(&broker, Arc::new(TracerState::default()));

        let stranger = Stranger {
            text: "x".to_owned(),
        };

        assert!(matches!(
            publisher.publish(&stranger, 0, "").await,
            Err(AmqpError::HandlerMismatchError(_))
        ));
        assert!(published(&broker).is_empty());
    }

    #[tokio::test]
    async fn closed_channel_is_replaced() {
        let broker = FakeBroker::new();
        let mut publisher = publisher(&broker, Arc::new(TracerState::default()));

        publisher.publish(&notice("a"), 0, "").await.unwrap();
        publisher.publish(&notice("b"), 0, "").await.unwrap();
        broker.close_channels();
        publisher.publish(&notice("c"), 0, "").await.unwrap();

        let declares = broker
            .calls()
            .iter()
            .filter(|c| matches!(c, FakeCall::ExchangeDeclare(_)))
            .count();
        assert_eq!(declares, 2);
        assert_eq!(published(&broker).len(), 3);
    }

    #[tokio::test]
    async fn unknown_connection_name_fails() {
        let broker = FakeBroker::new();
        let mut publisher = publisher(&broker, Arc::new(TracerState::default()));
        assert_eq!(publisher.get_connection_name(), None);

        publisher.set_connection_name("amazonmq").await;

        assert_eq!(publisher.get_connection_name(), Some("amazonmq"));
        assert!(matches!(
            publisher.publish(&notice("a"), 0, "").await,
            Err(AmqpError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn close_releases_the_channel_once() {
        let broker = FakeBroker::new();
        let mut publisher = publisher(&broker, Arc::new(TracerState::default()));

        publisher.close().await.unwrap();
        assert!(!broker.calls().contains(&FakeCall::CloseChannel));

        publisher.publish(&notice("a"), 0, "").await.unwrap();
        publisher.close().await.unwrap();
        publisher.close().await.unwrap();

        let closes = |broker: &FakeBroker| {
            broker
                .calls()
                .iter()
                .filter(|c| matches!(c, FakeCall::CloseChannel))
                .count()
        };
        assert_eq!(closes(&broker), 1);

        publisher.publish(&notice("b"), 0, "").await.unwrap();
        assert_eq!(published(&broker).len(), 2);
        assert_eq!(closes(&broker), 1);
    }

    #[tokio::test]
    async fn switching_connection_closes_the_old_channel() {
        let broker = FakeBroker::new();
        let mut publisher = publisher(&broker, Arc::new(TracerState::default()));

        publisher.publish(&notice("a"), 0, "").await.unwrap();
        publisher.set_connection_name("default").await;

        assert!(broker.calls().contains(&FakeCall::CloseChannel));
        publisher.publish(&notice("b"), 0, "").await.unwrap();
        assert_eq!(published(&broker).len(), 2);
    }

    #[tokio::test]
    async fn missing_exchange_fails() {
        let broker = FakeBroker::new();
        let mut publisher = Publisher::new(broker.registry(), Arc::new(TracerState::default()));

        assert!(matches!(
            publisher.publish(&notice("a"), 0, "").await,
            Err(AmqpError::ConfigurationError(_))
        ));
        assert!(broker.calls().is_empty());
    }
}
