// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Declarative runtime over RabbitMQ: exchanges, queues, consumers and
//! publishers described as configuration, with connection lifecycle,
//! topology declaration, lifetime bounded consumption and tracer token
//! propagation handled by the runtime.

#[cfg(test)]
mod testing;

pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod example;
pub mod exchange;
pub mod factory;
pub mod handler;
pub mod logger;
pub mod otel;
pub mod payload;
pub mod publisher;
pub mod queue;
pub mod raiser;
pub mod tracer;
