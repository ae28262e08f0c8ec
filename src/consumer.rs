// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! A consumer owns its queue (and through it the exchange), subscribes with a
//! unique tag, and drains deliveries until its lifetime expires. Each delivery
//! is decoded, attached to the exchange's payload type and dispatched to the
//! handler. A failing delivery is rejected once and logged; the loop keeps
//! serving the next one.
//!
//! Whatever way the loop ends, every registry connection is shut down, so one
//! consumer is expected per process.

use crate::{
    broker::{BrokerChannel, InboundMessage},
    connection::ConnectionRegistry,
    errors::AmqpError,
    handler::DynHandler,
    logger::{codes, QueueLogger},
    otel,
    payload::decode_body,
    queue::Queue,
    tracer::TracerState,
};
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{borrow::Cow, sync::Arc, time::Duration};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Length of the random part of a consumer tag.
pub const CONSUMER_TAG_HASH_LEN: usize = 10;

/// Upper bound of a consumer lifetime, one hundred years in minutes.
pub const MAX_LIFETIME_MINUTES: u64 = 100 * 365 * 24 * 60;

const MIN_WAIT: Duration = Duration::from_millis(10);

/// Subscription settings of a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerDefinition {
    pub tag_prefix: String,
    pub prefetch_size: u16,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
}

impl Default for ConsumerDefinition {
    fn default() -> Self {
        ConsumerDefinition {
            tag_prefix: String::new(),
            prefetch_size: 10,
            no_local: false,
            no_ack: false,
            exclusive: false,
            no_wait: false,
        }
    }
}

impl ConsumerDefinition {
    /// Default settings with the given consumer tag prefix.
    pub fn new(tag_prefix: &str) -> Self {
        ConsumerDefinition {
            tag_prefix: tag_prefix.to_owned(),
            ..Default::default()
        }
    }

    /// Unacked deliveries the broker may push at once.
    pub fn prefetch(mut self, prefetch_size: u16) -> Self {
        self.prefetch_size = prefetch_size;
        self
    }

    /// Every reason the definition cannot subscribe, empty when valid.
    pub fn violations(&self) -> Vec<String> {
        if self.tag_prefix.trim().is_empty() {
            return vec!["consumer tag prefix is required".to_owned()];
        }
        vec![]
    }
}

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unconfigured,
    Configured,
    Subscribed,
    /// Lifetime elapsed; the channel was closed by the consumer.
    Expired,
    /// The channel or the delivery stream was closed from outside.
    Closed,
    /// The loop died on an unrecoverable error.
    Failed,
}

/// Result of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler returned without error. Settlement is up to the handler.
    Handled,
    /// The runtime rejected the delivery.
    Rejected(String),
}

/// Lifetime bounded subscriber of one queue.
///
/// Built from a [`Queue`], the shared [`ConnectionRegistry`] and the process
/// [`TracerState`]; configured with a [`ConsumerDefinition`] and bound to a
/// handler before [`Consumer::consume`] runs the loop.
pub struct Consumer {
    queue: Queue,
    queue_created: bool,
    registry: Arc<ConnectionRegistry>,
    tracer: Arc<TracerState>,
    definition: Option<ConsumerDefinition>,
    handler: Option<Arc<dyn DynHandler>>,
    lifetime: u64,
    wait_timeout: Option<Duration>,
    state: ConsumerState,
    logger: QueueLogger,
}

impl Consumer {
    /// Creates an unconfigured consumer with the default lifetime.
    ///
    /// # Parameters
    /// * `queue` - Queue to subscribe to, created on first use
    /// * `registry` - Connections shut down when the loop ends
    /// * `tracer` - Tracer state seeded from every delivery
    ///
    /// # Returns
    /// A consumer in the `Unconfigured` state
    pub fn new(queue: Queue, registry: Arc<ConnectionRegistry>, tracer: Arc<TracerState>) -> Self {
        Consumer {
            queue,
            queue_created: false,
            registry,
            tracer,
            definition: None,
            handler: None,
            lifetime: crate::config::DEFAULT_LIFETIME_MINUTES.unsigned_abs(),
            wait_timeout: None,
            state: ConsumerState::Unconfigured,
            logger: QueueLogger::default(),
        }
    }

    /// Stores the subscription settings. Validated when consuming.
    pub fn configure(mut self, definition: ConsumerDefinition) -> Self {
        self.definition = Some(definition);
        self.state = ConsumerState::Configured;
        self
    }

    /// Lifetime in minutes. Negative values count as their absolute value and
    /// anything above [`MAX_LIFETIME_MINUTES`] is capped to it.
    pub fn lifetime(&mut self, minutes: i64) -> &mut Self {
        self.lifetime = minutes.unsigned_abs().min(MAX_LIFETIME_MINUTES);
        self
    }

    /// Effective lifetime in minutes.
    pub fn lifetime_minutes(&self) -> u64 {
        self.lifetime
    }

    /// Bound of a single transport wait. Defaults to the lifetime in seconds.
    pub fn wait_timeout(&mut self, wait: Duration) -> &mut Self {
        self.wait_timeout = Some(wait);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Queue the consumer subscribes to.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    fn validate(&self) -> Result<&ConsumerDefinition, AmqpError> {
        match &self.definition {
            Some(def) if def.violations().is_empty() => Ok(def),
            _ => Err(AmqpError::ConfigurationError(format!(
                "[{}] you must configure your consumer",
                codes::CONSUMER_BAD_IMPLEMENTATION
            ))),
        }
    }

    /// `{prefix}_{hash}` with a random 10 character hash.
    pub fn build_consumer_tag(&self) -> Result<String, AmqpError> {
        let def = self.validate()?;
        let hash = Uuid::new_v4().simple().to_string();

        Ok(format!(
            "{}_{}",
            def.tag_prefix,
            &hash[..CONSUMER_TAG_HASH_LEN]
        ))
    }

    /// Creates the queue on first use and picks up its exchange's log prefix.
    async fn ensure_queue(&mut self) -> Result<(), AmqpError> {
        if self.queue_created {
            return Ok(());
        }

        self.queue.create().await?;
        self.queue_created = true;

        let prefix = self.queue.exchange().await?.get_log_prefix().to_owned();
        self.logger = QueueLogger::new(&prefix);

        Ok(())
    }

    /// Validates the handler against the queue's exchange payload contract.
    pub async fn set_handler(&mut self, handler: Arc<dyn DynHandler>) -> Result<(), AmqpError> {
        self.ensure_queue().await?;

        let contract = handler.contract();
        self.queue
            .exchange()
            .await?
            .validate_payload_contract(&contract.payload)?;

        debug!(handler = contract.name, "handler bound");
        self.handler = Some(handler);
        Ok(())
    }

    /// Subscribes and serves deliveries until the lifetime expires, the channel
    /// closes, or the transport fails. Configuration errors are returned;
    /// loop failures are logged and reported through the final state.
    pub async fn consume(&mut self) -> Result<ConsumerState, AmqpError> {
        let def = self.validate()?.clone();
        if self.handler.is_none() {
            return Err(AmqpError::ConfigurationError(format!(
                "[{}] you must set a handler before consuming",
                codes::CONSUMER_HANDLER_BAD_IMPLEMENTATION
            )));
        }

        self.logger.info(
            codes::CONSUMER_EXECUTOR_START,
            json!({"title": "Consumer Executor Start"}),
        );

        let state = match self.run(&def).await {
            Ok(state) => state,
            Err(err) if err.is_setup_error() => {
                self.teardown().await;
                return Err(err);
            }
            Err(err) => {
                self.logger
                    .severe(codes::CONSUMER_EXECUTOR_WITH_ERROR, json!({}), &err);
                ConsumerState::Failed
            }
        };
        self.state = state;

        self.teardown().await;
        Ok(state)
    }

    async fn teardown(&mut self) {
        self.registry.shutdown_all().await;
        self.logger.info(
            codes::CONSUMER_EXECUTOR_END,
            json!({"title": "Consumer Executor End", "state": format!("{:?}", self.state)}),
        );
    }

    async fn run(&mut self, def: &ConsumerDefinition) -> Result<ConsumerState, AmqpError> {
        self.ensure_queue().await?;

        let channel = self.queue.channel().await?;
        let queue_name = self.queue.name()?.to_owned();
        let tag = self.build_consumer_tag()?;

        channel.basic_qos(def.prefetch_size, false).await?;
        let mut deliveries = channel.basic_consume(&queue_name, &tag, def).await?;
        self.state = ConsumerState::Subscribed;
        debug!(queue = queue_name, tag = tag, "consumer subscribed");

        let lifetime = Duration::from_secs(self.lifetime.saturating_mul(60));
        // `None` only when the deadline is past what the clock can represent
        let expires_at = Instant::now().checked_add(lifetime);
        let wait = self.wait_timeout.unwrap_or(lifetime);

        loop {
            if !channel.is_open() {
                return Ok(ConsumerState::Closed);
            }

            let now = Instant::now();
            if expires_at.is_some_and(|deadline| now >= deadline) {
                self.close_channel(&channel).await;
                return Ok(ConsumerState::Expired);
            }

            // never sleep far past the expiry
            let remaining = expires_at.map_or(wait, |deadline| {
                deadline
                    .saturating_duration_since(now)
                    .saturating_add(Duration::from_secs(1))
            });

            let bound = wait.min(remaining).max(MIN_WAIT);

            match timeout(bound, deliveries.next()).await {
                Err(_elapsed) => {
                    debug!("{}", AmqpError::TransportTimeout);
                    continue;
                }
                Ok(None) => return Ok(ConsumerState::Closed),
                Ok(Some(Err(err))) => return Err(err),
                Ok(Some(Ok(message))) => {
                    self.handle_delivery(message).await;
                }
            }
        }
    }

    async fn close_channel(&mut self, channel: &Arc<dyn BrokerChannel>) {
        if let Err(err) = self.queue.close().await {
            warn!(error = err.to_string(), "failure to close the consumer channel");
        }
        if channel.is_open() {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "failure to close the consumer channel");
            }
        }
    }

    /// Processes one delivery. Failures reject the message once and never
    /// escape.
    pub async fn handle_delivery(&mut self, message: InboundMessage) -> DeliveryOutcome {
        let headers = message.headers();
        let tracer = global::tracer(otel::CONSUMER_TRACER);
        let (_ctx, mut span) = otel::new_span(&headers, &tracer, &message.exchange);

        self.tracer.configure_from_headers(&headers);

        let outcome = match self.process(&message).await {
            Ok(()) => {
                span.set_status(Status::Ok);
                DeliveryOutcome::Handled
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });

                if let Err(reject_err) = message.reject().await {
                    span.record_error(&reject_err);
                    warn!(error = reject_err.to_string(), "failure to reject message");
                }
                self.logger
                    .error(codes::CONSUMER_HANDLER_WITH_ERROR, json!({}), &err);

                DeliveryOutcome::Rejected(err.to_string())
            }
        };

        self.logger.info(
            codes::CONSUMER_HANDLER_END,
            json!({"title": "Consumer handler end"}),
        );

        outcome
    }

    async fn process(&mut self, message: &InboundMessage) -> Result<(), AmqpError> {
        let values = decode_body(message.body());
        self.logger.info(
            codes::CONSUMER_HANDLER_START,
            json!({"title": "Consumer handler start", "message": values}),
        );

        let Some(handler) = self.handler.clone() else {
            return Err(AmqpError::MessageHandlingError(
                "no handler is set".to_owned(),
            ));
        };

        self.queue
            .exchange()
            .await?
            .validate_payload_contract(&handler.contract().payload)?;

        handler.dispatch(&values, message).await.map_err(|err| match err {
            AmqpError::MessageHandlingError(_) => err,
            other => AmqpError::MessageHandlingError(other.to_string()),
        })
    }
}
