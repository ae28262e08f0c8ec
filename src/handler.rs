// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler processes the deliveries of one consumer. It declares the payload
//! type it accepts through [`Handler::Payload`]; the consumer checks that type
//! against its exchange's payload contract when the handler is set, so a
//! mismatch never reaches delivery time.
//!
//! Successful handling is not acknowledged by the runtime. Handlers ack through
//! the raw message they receive; only failures are rejected automatically.

use crate::{
    broker::InboundMessage,
    errors::AmqpError,
    payload::{Payload, PayloadContract, PayloadMap},
};
use async_trait::async_trait;

/// Business logic run for every delivery of a consumer.
///
/// The runtime decodes the body into `Payload` before calling [`Handler::handle`].
/// Settling the message is up to the handler on success; an error makes the
/// runtime reject it.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    type Payload: Payload;

    async fn handle(&self, payload: Self::Payload, message: &InboundMessage)
        -> Result<(), AmqpError>;
}

/// What a handler expects from its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerContract {
    pub payload: PayloadContract,
    pub name: &'static str,
}

/// Object safe form of [`Handler`], used where handlers are resolved by id.
#[async_trait]
pub trait DynHandler: Send + Sync {
    fn contract(&self) -> HandlerContract;

    /// Builds the payload from the decoded body and runs the handler.
    async fn dispatch(&self, values: &PayloadMap, message: &InboundMessage)
        -> Result<(), AmqpError>;
}

#[async_trait]
impl<H: Handler> DynHandler for H {
    fn contract(&self) -> HandlerContract {
        HandlerContract {
            payload: PayloadContract::of::<H::Payload>(),
            name: std::any::type_name::<H>(),
        }
    }

    async fn dispatch(
        &self,
        values: &PayloadMap,
        message: &InboundMessage,
    ) -> Result<(), AmqpError> {
        let payload = H::Payload::from_values(values)
            .map_err(|err| AmqpError::MessageHandlingError(err.to_string()))?;

        self.handle(payload, message).await
    }
}
