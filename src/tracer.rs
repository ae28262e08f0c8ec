// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Tracer Token Propagation
//!
//! The tracer token is a correlation identifier shared by everything the
//! process does. It is seeded from the `tracer` header of an inbound message, or
//! freshly generated, and attached to every outbound message.

use lapin::types::{AMQPValue, LongString, ShortString};
use std::{collections::BTreeMap, sync::RwLock};
use uuid::Uuid;

/// Value some producers write when they do not propagate a token.
pub const TRACE_NOT_IMPLEMENTED: &str = "TRACE_NOT_IMPLEMENTED";

/// Correlation token of the current delivery or request.
#[derive(Debug)]
pub struct TracerState {
    headers: Vec<String>,
    value: RwLock<String>,
}

impl Default for TracerState {
    fn default() -> Self {
        TracerState::new(vec![crate::config::DEFAULT_TRACER_HEADER.to_owned()])
    }
}

impl TracerState {
    /// `headers` are the names the token is read from and written to. The
    /// first one is used for outbound messages.
    pub fn new(headers: Vec<String>) -> Self {
        let mut headers: Vec<String> = headers
            .into_iter()
            .map(|h| h.to_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if headers.is_empty() {
            headers.push(crate::config::DEFAULT_TRACER_HEADER.to_owned());
        }

        TracerState {
            headers,
            value: RwLock::new(String::new()),
        }
    }

    /// Fresh random token.
    pub fn generate() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Header written on outbound messages.
    pub fn header_name(&self) -> &str {
        &self.headers[0]
    }

    /// Token in effect, empty before any is set.
    pub fn current(&self) -> String {
        match self.value.read() {
            Ok(value) => value.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replaces the token in effect.
    pub fn set(&self, token: &str) {
        match self.value.write() {
            Ok(mut value) => *value = token.to_owned(),
            Err(poisoned) => *poisoned.into_inner() = token.to_owned(),
        }
    }

    /// Seeds the token from inbound headers, generating a fresh one when no
    /// tracer header is present. Returns the token in effect.
    pub fn configure_from_headers(&self, headers: &BTreeMap<ShortString, AMQPValue>) -> String {
        let token = self
            .headers
            .iter()
            .find_map(|name| headers.get(name.as_str()).and_then(header_as_string))
            .filter(|token| !token.is_empty())
            .unwrap_or_else(Self::generate);

        self.set(&token);
        token
    }

    /// Token to attach to an outbound message: the current one, unless it is
    /// empty or the not implemented sentinel.
    pub fn outbound_token(&self) -> String {
        let current = self.current();
        if current.is_empty() || current == TRACE_NOT_IMPLEMENTED {
            return Self::generate();
        }
        current
    }

    /// Writes the outbound token into `headers` and returns it.
    pub fn inject(&self, headers: &mut BTreeMap<ShortString, AMQPValue>) -> String {
        let token = self.outbound_token();
        headers.insert(
            ShortString::from(self.header_name().to_owned()),
            AMQPValue::LongString(LongString::from(token.clone())),
        );
        token
    }
}

fn header_as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        _ => None,
    }
}
