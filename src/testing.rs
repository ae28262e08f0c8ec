// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests. Records every topology and publish
//! call, routes published messages to bound queues and records settlements.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, BrokerConnector, DeliveryStream, InboundMessage,
        MessageAcker, OutboundMessage, Settlement,
    },
    config::{ConnectionSettings, RabbitMqConfigs, DEFAULT_CONNECTION_NAME},
    connection::ConnectionRegistry,
    consumer::ConsumerDefinition,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, AMQP_HEADERS_DELAYED_EXCHANGE_TYPE},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, PartialEq)]
pub enum FakeCall {
    ExchangeDeclare(ExchangeDefinition),
    QueueDeclare(QueueDefinition),
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Qos {
        prefetch: u16,
        global: bool,
    },
    Consume {
        queue: String,
        tag: String,
    },
    Publish {
        exchange: String,
        routing_key: String,
        message: OutboundMessage,
    },
    CloseChannel,
    CloseConnection(String),
}

struct Mailbox {
    tx: UnboundedSender<InboundMessage>,
    rx: Option<UnboundedReceiver<InboundMessage>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Mailbox { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct FakeState {
    calls: Mutex<Vec<FakeCall>>,
    exchanges: Mutex<HashMap<String, ExchangeDefinition>>,
    bindings: Mutex<Vec<(String, String, String)>>,
    mailboxes: Mutex<HashMap<String, Mailbox>>,
    settlements: Mutex<Vec<(u64, Settlement)>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    next_tag: AtomicU64,
    close_after: Mutex<Option<usize>>,
    fail_with: Mutex<Option<String>>,
}

impl FakeState {
    fn record(&self, call: FakeCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn push(
        self: &Arc<Self>,
        queue: &str,
        body: Vec<u8>,
        props: AMQPProperties,
        exchange: &str,
        rk: &str,
    ) {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let acker = Arc::new(FakeAcker {
            state: self.clone(),
            tag,
        });
        let message = InboundMessage::new(body, props, exchange, rk, tag, acker);

        let mut mailboxes = self.mailboxes.lock().unwrap();
        let mailbox = mailboxes
            .entry(queue.to_owned())
            .or_insert_with(Mailbox::new);
        let _ = mailbox.tx.send(message);
    }

    fn route(self: &Arc<Self>, exchange: &str, routing_key: &str, message: &OutboundMessage) {
        let kind = match self.exchanges.lock().unwrap().get(exchange) {
            Some(def) => effective_kind(def),
            None => return,
        };

        let targets: Vec<String> = self
            .bindings
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, ex, key)| {
                ex == exchange
                    && match kind {
                        ExchangeKind::Direct => key == routing_key,
                        ExchangeKind::Topic => topic_matches(key, routing_key),
                        _ => true,
                    }
            })
            .map(|(queue, _, _)| queue.clone())
            .collect();

        for queue in targets {
            self.push(
                &queue,
                message.body.clone(),
                message.properties(),
                exchange,
                routing_key,
            );
        }
    }
}

fn effective_kind(def: &ExchangeDefinition) -> ExchangeKind {
    match def.kind.clone().unwrap_or_default() {
        ExchangeKind::XMessageDelayed => def
            .arguments
            .get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default(),
        kind => kind,
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn walk(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                walk(&pattern[1..], key) || (!key.is_empty() && walk(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => walk(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => walk(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    walk(&pattern, &key)
}

/// Handle to the in-memory broker shared by a test.
pub struct FakeBroker {
    state: Arc<FakeState>,
    registry: Arc<ConnectionRegistry>,
}

impl FakeBroker {
    pub fn new() -> Self {
        let state = Arc::new(FakeState::default());

        let mut configs = RabbitMqConfigs::default();
        configs.connections.insert(
            DEFAULT_CONNECTION_NAME.to_owned(),
            ConnectionSettings {
                host: "localhost".to_owned(),
                port: 5672,
                user: "guest".to_owned(),
                password: "guest".to_owned(),
                ..Default::default()
            },
        );

        let connector = FakeConnector {
            state: state.clone(),
        };
        let registry = Arc::new(ConnectionRegistry::new(Some(configs), Arc::new(connector)));

        FakeBroker { state, registry }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn settlements(&self) -> Vec<(u64, Settlement)> {
        self.state.settlements.lock().unwrap().clone()
    }

    /// Queues a message straight into `queue`, optionally with a tracer header.
    pub fn deliver(&self, queue: &str, body: &[u8], tracer: Option<&str>) {
        let mut props = AMQPProperties::default();
        if let Some(token) = tracer {
            let mut headers = BTreeMap::new();
            headers.insert(
                ShortString::from("tracer"),
                AMQPValue::LongString(LongString::from(token)),
            );
            props = props.with_headers(FieldTable::from(headers));
        }
        self.state.push(queue, body.to_vec(), props, "", queue);
    }

    /// Subscriptions opened after this call end after `n` deliveries.
    pub fn close_consumers_after(&self, n: usize) {
        *self.state.close_after.lock().unwrap() = Some(n);
    }

    /// Subscriptions opened after this call fail on their first poll.
    pub fn fail_consumers(&self, reason: &str) {
        *self.state.fail_with.lock().unwrap() = Some(reason.to_owned());
    }

    /// Marks every channel opened so far as closed by the broker.
    pub fn close_channels(&self) {
        for channel in self.state.channels.lock().unwrap().iter() {
            channel.open.store(false, Ordering::SeqCst);
        }
    }
}

struct FakeConnector {
    state: Arc<FakeState>,
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(
        &self,
        name: &str,
        _settings: &ConnectionSettings,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let connection = FakeConnection {
            state: self.state.clone(),
            name: name.to_owned(),
            connected: AtomicBool::new(true),
        };
        Ok(Arc::new(connection) as Arc<dyn BrokerConnection>)
    }
}

struct FakeConnection {
    state: Arc<FakeState>,
    name: String,
    connected: AtomicBool,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), AmqpError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.connected.store(false, Ordering::SeqCst);
        self.state.record(FakeCall::CloseConnection(self.name.clone()));
        Ok(())
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError);
        }
        let channel = Arc::new(FakeChannel {
            state: self.state.clone(),
            open: AtomicBool::new(true),
        });
        self.state.channels.lock().unwrap().push(channel.clone());
        Ok(channel as Arc<dyn BrokerChannel>)
    }
}

struct FakeChannel {
    state: Arc<FakeState>,
    open: AtomicBool,
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.state.record(FakeCall::ExchangeDeclare(def.clone()));
        self.state
            .exchanges
            .lock()
            .unwrap()
            .insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.state.record(FakeCall::QueueDeclare(def.clone()));
        self.state
            .mailboxes
            .lock()
            .unwrap()
            .entry(def.name.clone())
            .or_insert_with(Mailbox::new);
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.state.record(FakeCall::QueueBind {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        self.state.bindings.lock().unwrap().push((
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.state.record(FakeCall::Qos {
            prefetch: prefetch_count,
            global,
        });
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _def: &ConsumerDefinition,
    ) -> Result<DeliveryStream, AmqpError> {
        self.state.record(FakeCall::Consume {
            queue: queue.to_owned(),
            tag: consumer_tag.to_owned(),
        });

        let rx = self
            .state
            .mailboxes
            .lock()
            .unwrap()
            .entry(queue.to_owned())
            .or_insert_with(Mailbox::new)
            .rx
            .take()
            .ok_or_else(|| AmqpError::BindingConsumerError(queue.to_owned()))?;
        let close_after = *self.state.close_after.lock().unwrap();
        let fail_with = self.state.fail_with.lock().unwrap().clone();

        let deliveries = stream::unfold(
            (rx, 0usize, fail_with),
            move |(mut rx, served, fail_with)| async move {
                if let Some(reason) = fail_with {
                    return Some((Err(AmqpError::LoopFatalError(reason)), (rx, served, None)));
                }
                if close_after.is_some_and(|n| served >= n) {
                    return None;
                }
                let message = rx.recv().await?;
                Some((Ok(message), (rx, served + 1, None)))
            },
        );

        Ok(deliveries.boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::PublishingError("channel is closed".to_owned()));
        }
        self.state.record(FakeCall::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            message: message.clone(),
        });
        self.state.route(exchange, routing_key, message);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        self.state.record(FakeCall::CloseChannel);
        Ok(())
    }
}

struct FakeAcker {
    state: Arc<FakeState>,
    tag: u64,
}

#[async_trait]
impl MessageAcker for FakeAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.state
            .settlements
            .lock()
            .unwrap()
            .push((self.tag, Settlement::Acked));
        Ok(())
    }

    async fn reject(&self) -> Result<(), AmqpError> {
        self.state
            .settlements
            .lock()
            .unwrap()
            .push((self.tag, Settlement::Rejected));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("#.created", "a.b.created"));
        assert!(!topic_matches("orders.*", "orders.a.b"));
        assert!(!topic_matches("orders", "payments"));
    }
}
