// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Raiser
//!
//! Process entry point of one consumer: resolves the consumer and handler ids,
//! loads the optional launch payload from the payload cache, binds the handler
//! and consumes until the lifetime runs out. The cached payload is forgotten on
//! every exit path.
//!
//! [`launch_plan`] expands the configured consumers into one launch per clone,
//! the input of the external scheduler.

use crate::{
    config::RabbitMqConfigs,
    consumer::ConsumerState,
    errors::AmqpError,
    factory::{ConsumerFactory, RuntimeContext},
    logger::{codes, QueueLogger},
    payload::PayloadMap,
};
use serde_json::{json, Value};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

/// Arguments of a single consumer process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaiserArgs {
    pub consumer: String,
    pub handler: String,
    pub clone: u32,
    /// Minutes. The sign is ignored.
    pub lifetime: i64,
    pub payload_key: Option<String>,
}

/// Key value store holding launch payloads.
#[cfg_attr(test, mockall::automock)]
pub trait PayloadCache: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Value>, AmqpError>;

    fn store(&self, key: &str, payload: &PayloadMap) -> Result<(), AmqpError>;

    fn forget(&self, key: &str) -> Result<(), AmqpError>;
}

/// One `<key>.json` file per entry under a directory.
pub struct FilePayloadCache {
    dir: PathBuf,
}

impl Default for FilePayloadCache {
    fn default() -> Self {
        FilePayloadCache::new(std::env::temp_dir().join("rabbitmq-runtime"))
    }
}

impl FilePayloadCache {
    /// Cache rooted at `dir`, created on first store.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        FilePayloadCache {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

fn cache_error(key: &str, err: impl std::fmt::Display) -> AmqpError {
    AmqpError::ConfigurationError(format!(
        "[{}] payload cache `{}`: {}",
        codes::CONSUMER_RAISER_BAD_IMPLEMENTATION,
        key,
        err
    ))
}

impl PayloadCache for FilePayloadCache {
    fn load(&self, key: &str) -> Result<Option<Value>, AmqpError> {
        let contents = match fs::read(self.path(key)) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(cache_error(key, err)),
        };

        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|err| cache_error(key, err))
    }

    fn store(&self, key: &str, payload: &PayloadMap) -> Result<(), AmqpError> {
        fs::create_dir_all(&self.dir).map_err(|err| cache_error(key, err))?;
        let contents = serde_json::to_vec(payload).map_err(|err| cache_error(key, err))?;
        fs::write(self.path(key), contents).map_err(|err| cache_error(key, err))
    }

    fn forget(&self, key: &str) -> Result<(), AmqpError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(cache_error(key, err)),
        }
    }
}

/// Runs one consumer process from its launch arguments.
pub struct ConsumerRaiser {
    factory: ConsumerFactory,
    context: RuntimeContext,
    cache: Arc<dyn PayloadCache>,
}

impl ConsumerRaiser {
    /// Creates a raiser.
    ///
    /// # Parameters
    /// * `factory` - Registered consumers and handlers
    /// * `context` - Registry and tracer of the process
    /// * `cache` - Store the launch payload is read from and forgotten in
    ///
    /// # Returns
    /// A raiser ready to [`ConsumerRaiser::run`]
    pub fn new(
        factory: ConsumerFactory,
        context: RuntimeContext,
        cache: Arc<dyn PayloadCache>,
    ) -> Self {
        ConsumerRaiser {
            factory,
            context,
            cache,
        }
    }

    /// Raises the consumer and blocks until its loop ends.
    pub async fn run(&self, args: &RaiserArgs) -> Result<ConsumerState, AmqpError> {
        let result = self.raise(args).await;

        if let Some(key) = args.payload_key.as_deref().filter(|k| !k.is_empty()) {
            if let Err(err) = self.cache.forget(key) {
                warn!(error = err.to_string(), key = key, "failure to forget payload");
            }
        }

        result
    }

    async fn raise(&self, args: &RaiserArgs) -> Result<ConsumerState, AmqpError> {
        let payload = self.payload(args.payload_key.as_deref())?;

        let mut consumer = self.factory.consumer(&args.consumer, &self.context, &payload)?;
        let handler = self.factory.handler(&args.handler, &self.context)?;

        debug!(
            consumer = args.consumer,
            handler = args.handler,
            clone = args.clone,
            "raising consumer"
        );

        consumer.set_handler(handler).await?;
        consumer.lifetime(args.lifetime);
        consumer.consume().await
    }

    fn payload(&self, key: Option<&str>) -> Result<PayloadMap, AmqpError> {
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            return Ok(PayloadMap::new());
        };

        match self.cache.load(key)? {
            None => Ok(PayloadMap::new()),
            Some(Value::Object(map)) => Ok(map),
            Some(_) => Err(AmqpError::ConfigurationError(format!(
                "[{}] consumer payload must be a map",
                codes::CONSUMER_PAYLOAD_MUST_BE_MAP
            ))),
        }
    }
}

/// One scheduled consumer process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerLaunch {
    pub consumer: String,
    pub handler: String,
    pub lifetime: i64,
    pub clone: u32,
}

impl ConsumerLaunch {
    /// Arguments of the launch, without a payload key.
    pub fn to_args(&self) -> RaiserArgs {
        RaiserArgs {
            consumer: self.consumer.clone(),
            handler: self.handler.clone(),
            clone: self.clone,
            lifetime: self.lifetime,
            payload_key: None,
        }
    }

    /// Command line of the launch, for the external scheduler.
    pub fn command_line(&self, program: &str) -> String {
        format!(
            "{} consume --consumer={} --handler={} --lifetime={} --clone={}",
            program, self.consumer, self.handler, self.lifetime, self.clone
        )
    }
}

/// Expands every configured consumer into `quantity` launches, clones numbered
/// from 1. Homologation mode runs a single clone of each.
pub fn launch_plan(configs: &RabbitMqConfigs) -> Vec<ConsumerLaunch> {
    if configs.consumers.is_empty() {
        QueueLogger::default().info(
            codes::ZERO_CONSUMERS_IN_PROJECT,
            json!({"message": "The project has 0 consumers configured"}),
        );
        return vec![];
    }

    configs
        .consumers
        .iter()
        .flat_map(|entry| {
            let quantity = if configs.is_homol() { 1 } else { entry.quantity };
            (1..=quantity).map(move |clone| ConsumerLaunch {
                consumer: entry.consumer.clone(),
                handler: entry.handler.clone(),
                lifetime: entry.lifetime,
                clone,
            })
        })
        .collect()
}
