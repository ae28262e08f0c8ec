// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Logger
//!
//! Thin wrapper over `tracing` that stamps every event with a stable token of the
//! form `{CODE}__{PREFIX}`, where the prefix identifies the exchange the event
//! belongs to. Log pipelines can then filter by code or by exchange.

use serde_json::Value;
use std::fmt::Display;
use tracing::{error, info};

/// Stable log and error codes.
pub mod codes {
    pub const PACKAGE_BAD_IMPLEMENTATION: &str = "QUE-001";
    pub const EXCHANGE_BAD_IMPLEMENTATION: &str = "QUE-002";
    pub const QUEUE_BAD_IMPLEMENTATION: &str = "QUE-003";
    pub const CONNECTION_BAD_IMPLEMENTATION: &str = "QUE-004";
    pub const PUBLISHER_BAD_IMPLEMENTATION: &str = "QUE-005";
    pub const CONSUMER_HANDLER_BAD_IMPLEMENTATION: &str = "QUE-006";
    pub const CONSUMER_HANDLER_WITH_ERROR: &str = "QUE-007";
    pub const CONSUMER_EXECUTOR_WITH_ERROR: &str = "QUE-008";
    pub const CONSUMER_RAISER_BAD_IMPLEMENTATION: &str = "QUE-009";
    pub const CONSUMER_BAD_IMPLEMENTATION: &str = "QUE-010";
    pub const CONSUMER_PAYLOAD_MUST_BE_MAP: &str = "QUE-011";

    pub const CONSUMER_EXECUTOR_START: &str = "QUE-INF-001";
    pub const CONSUMER_EXECUTOR_END: &str = "QUE-INF-002";
    pub const CONSUMER_HANDLER_START: &str = "QUE-INF-003";
    pub const CONSUMER_HANDLER_END: &str = "QUE-INF-004";
    pub const ZERO_CONSUMERS_IN_PROJECT: &str = "QUE-INF-005";
    pub const PUBLISHER_PUBLISHED_MESSAGE: &str = "QUE-INF-006";
}

/// Prefix used when an exchange does not declare its own.
pub const DEFAULT_LOG_PREFIX: &str = "BAD_IMPLEMENTATION";

/// Writes `tracing` events tagged with a `{code}__{prefix}` token.
#[derive(Debug, Clone)]
pub struct QueueLogger {
    prefix: String,
}

impl Default for QueueLogger {
    fn default() -> Self {
        QueueLogger::new(DEFAULT_LOG_PREFIX)
    }
}

impl QueueLogger {
    /// Logger writing tokens with `prefix`, usually an exchange log prefix.
    pub fn new(prefix: &str) -> Self {
        QueueLogger {
            prefix: prefix.to_owned(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Builds the `{code}__{prefix}` token.
    pub fn token(&self, code: &str) -> String {
        format!("{}__{}", code, self.prefix)
    }

    /// Informational event with its JSON context.
    pub fn info(&self, code: &str, context: Value) {
        info!(token = self.token(code), context = %context);
    }

    /// Error event with its JSON context and the error text.
    pub fn error(&self, code: &str, context: Value, err: &dyn Display) {
        error!(
            token = self.token(code),
            context = %context,
            error = err.to_string()
        );
    }

    /// Error level event flagged as severe. Used when the consumer loop dies.
    pub fn severe(&self, code: &str, context: Value, err: &dyn Display) {
        error!(
            token = self.token(code),
            severity = "severe",
            context = %context,
            error = err.to_string()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_joins_code_and_prefix() {
        let logger = QueueLogger::new("EXAMPLE");

        assert_eq!(
            logger.token(codes::CONSUMER_EXECUTOR_START),
            "QUE-INF-001__EXAMPLE"
        );
    }

    #[test]
    fn default_prefix_flags_bad_implementation() {
        assert_eq!(
            QueueLogger::default().token(codes::CONSUMER_HANDLER_WITH_ERROR),
            "QUE-007__BAD_IMPLEMENTATION"
        );
    }
}
