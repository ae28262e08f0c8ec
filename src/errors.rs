// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Runtime
//!
//! This module provides the error type shared by every component of the runtime.
//! The `AmqpError` enum carries both the setup taxonomy (configuration and
//! handler contract violations, which are always raised before any network call)
//! and the transport failures surfaced by the broker client.

use thiserror::Error;

/// Represents errors that can occur while configuring or running the runtime.
///
/// Setup errors (`ConfigurationError`, `HandlerMismatchError`) are fatal to the
/// calling operation and never retried. `TransportTimeout` is benign inside the
/// consumer wait loop. `MessageHandlingError` is isolated to a single delivery.
/// `LoopFatalError` terminates the consumer loop.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Missing or invalid descriptor fields, unknown factories, missing settings
    #[error("bad configuration: {0}")]
    ConfigurationError(String),

    /// Payload or handler type contract violation
    #[error("handler mismatch: {0}")]
    HandlerMismatchError(String),

    /// The transport wait elapsed without any delivery
    #[error("transport timeout")]
    TransportTimeout,

    /// Failure while decoding, attaching or dispatching a single delivery
    #[error("failure to handle message: {0}")]
    MessageHandlingError(String),

    /// Unrecoverable failure inside the consumer wait loop
    #[error("consumer loop failure: {0}")]
    LoopFatalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error parsing or serializing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error closing a channel or a connection
    #[error("failure to close `{0}`")]
    CloseError(String),
}

impl AmqpError {
    /// True for the setup errors that must abort before any network call.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            AmqpError::ConfigurationError(_) | AmqpError::HandlerMismatchError(_)
        )
    }
}
