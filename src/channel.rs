// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module implements the broker primitives on top of lapin. It establishes
//! connections to the RabbitMQ server from named settings, creates channels on
//! them, and translates declarations, subscriptions and publications into lapin
//! calls.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, BrokerConnector, DeliveryStream, InboundMessage,
        MessageAcker, OutboundMessage,
    },
    config::ConnectionSettings,
    consumer::ConsumerDefinition,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    uri::{AMQPScheme, AMQPUri},
    Channel, Connection, ConnectionProperties,
};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Virtual host used by every connection.
pub const DEFAULT_VHOST: &str = "/";
/// Connect timeout for plain connections, in milliseconds.
pub const CONNECTION_TIMEOUT_MS: u64 = 3_000;
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections.
pub struct LapinConnector {
    app_name: String,
}

impl LapinConnector {
    /// Connections are named `{app_name}-{connection name}` on the broker.
    pub fn new(app_name: &str) -> Self {
        LapinConnector {
            app_name: app_name.to_owned(),
        }
    }
}

/// Builds the URI for the given settings.
///
/// TLS settings use the `amqps` scheme on the fixed `/` vhost; lapin verifies
/// the broker certificate against the host trust store. Plain settings carry
/// the heartbeat and the connect timeout.
///
/// # Parameters
/// * `settings` - Named connection settings
///
/// # Returns
/// The URI handed to `Connection::connect_uri`
pub fn amqp_uri(settings: &ConnectionSettings) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.userinfo.username = settings.user.clone();
    uri.authority.userinfo.password = settings.password.clone();
    uri.authority.host = settings.host.clone();
    uri.authority.port = settings.port;
    uri.vhost = DEFAULT_VHOST.to_owned();

    if settings.ssl {
        uri.scheme = AMQPScheme::AMQPS;
    } else {
        uri.scheme = AMQPScheme::AMQP;
        uri.query.heartbeat = Some(settings.heartbeat());
        uri.query.connection_timeout = Some(CONNECTION_TIMEOUT_MS);
    }

    uri
}

async fn open(uri: &AMQPUri, properties: &ConnectionProperties) -> Result<Connection, AmqpError> {
    debug!("creating amqp connection...");
    match Connection::connect_uri(uri.clone(), properties.clone()).await {
        Ok(conn) => {
            debug!("amqp connected");
            Ok(conn)
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(uri.authority.host.clone()))
        }
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(
        &self,
        name: &str,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let uri = amqp_uri(settings);
        let properties = ConnectionProperties::default().with_connection_name(
            LongString::from(format!("{}-{}", self.app_name, name)),
        );

        let conn = open(&uri, &properties).await?;

        Ok(Arc::new(LapinConnection {
            uri,
            properties,
            inner: RwLock::new(Arc::new(conn)),
        }))
    }
}

/// A lapin connection that can be replaced in place on reconnect.
pub struct LapinConnection {
    uri: AMQPUri,
    properties: ConnectionProperties,
    inner: RwLock<Arc<Connection>>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn is_connected(&self) -> bool {
        self.inner.read().await.status().connected()
    }

    async fn reconnect(&self) -> Result<(), AmqpError> {
        let conn = open(&self.uri, &self.properties).await?;
        *self.inner.write().await = Arc::new(conn);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let conn = self.inner.read().await.clone();
        conn.close(REPLY_SUCCESS, "shutdown").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::CloseError("connection".to_owned())
        })
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let conn = self.inner.read().await.clone();

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel::new(channel)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

/// [`BrokerChannel`] over a lapin channel.
pub struct LapinChannel {
    channel: Channel,
    closed: AtomicBool,
}

impl LapinChannel {
    /// Wraps an open lapin channel.
    pub fn new(channel: Channel) -> Self {
        LapinChannel {
            channel,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.channel.status().connected()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.clone().unwrap_or_default().into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                field_table(&def.arguments),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(err.to_string()))
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: def.no_wait,
                },
                field_table(&def.declare_arguments()),
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::DeclareQueueError(format!("{}: {}", def.name, err)))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|_| {
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        def: &ConsumerDefinition,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: def.no_local,
                    no_ack: def.no_ack,
                    exclusive: def.exclusive,
                    nowait: def.no_wait,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(consumer_tag.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let stream = consumer.map(|result| match result {
            Ok(delivery) => Ok(InboundMessage::new(
                delivery.data,
                delivery.properties,
                delivery.exchange.as_str(),
                delivery.routing_key.as_str(),
                delivery.delivery_tag,
                Arc::new(LapinAcker(delivery.acker)),
            )),
            Err(err) => Err(AmqpError::LoopFatalError(err.to_string())),
        });

        Ok(stream.boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.body,
                message.properties(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(exchange.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) || !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "closing channel")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the channel");
                AmqpError::CloseError("channel".to_owned())
            })
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl MessageAcker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|_| AmqpError::AckMessageError)
    }

    async fn reject(&self) -> Result<(), AmqpError> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|_| AmqpError::RejectMessageError)
    }
}

/// Converts declare arguments into an AMQP field table.
pub fn field_table(arguments: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in arguments {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    FieldTable::from(table)
}

/// Converts a JSON value into the closest AMQP field value.
pub fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(v), _) => AMQPValue::LongLongInt(v),
            (None, Some(v)) => AMQPValue::Double(v),
            _ => AMQPValue::Void,
        },
        Value::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        Value::Array(values) => AMQPValue::FieldArray(FieldArray::from(
            values.iter().map(amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(map) => {
            let nested: BTreeMap<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            AMQPValue::FieldTable(field_table(&nested))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(ssl: bool) -> ConnectionSettings {
        ConnectionSettings {
            host: "rabbit".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "p@ss".to_owned(),
            ssl,
            heartbeat: None,
        }
    }

    #[test]
    fn plain_uri_carries_heartbeat_and_timeout() {
        let uri = amqp_uri(&settings(false));

        assert_eq!(uri.scheme, AMQPScheme::AMQP);
        assert_eq!(uri.authority.host, "rabbit");
        assert_eq!(uri.authority.userinfo.password, "p@ss");
        assert_eq!(uri.vhost, DEFAULT_VHOST);
        assert_eq!(uri.query.heartbeat, Some(10));
        assert_eq!(uri.query.connection_timeout, Some(CONNECTION_TIMEOUT_MS));
    }

    #[test]
    fn tls_uri_uses_amqps_on_root_vhost() {
        let uri = amqp_uri(&settings(true));

        assert_eq!(uri.scheme, AMQPScheme::AMQPS);
        assert_eq!(uri.vhost, DEFAULT_VHOST);
        assert_eq!(uri.query.heartbeat, None);
    }

    #[test]
    fn arguments_convert_to_field_table() {
        let mut args = BTreeMap::new();
        args.insert("x-delayed-type".to_owned(), json!("direct"));
        args.insert("x-max-length".to_owned(), json!(10));
        args.insert("x-flag".to_owned(), json!(true));

        let table = field_table(&args);
        let inner = table.inner();

        assert_eq!(
            inner.get("x-delayed-type"),
            Some(&AMQPValue::LongString(LongString::from("direct")))
        );
        assert_eq!(inner.get("x-max-length"), Some(&AMQPValue::LongLongInt(10)));
        assert_eq!(inner.get("x-flag"), Some(&AMQPValue::Boolean(true)));
    }
}
