// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use clap::{Parser, Subcommand};
use rabbitmq_runtime::{
    config::{RabbitMqConfigs, DEFAULT_LIFETIME_MINUTES},
    consumer::ConsumerState,
    errors::AmqpError,
    example,
    factory::{ConsumerFactory, RuntimeContext},
    raiser::{launch_plan, ConsumerRaiser, FilePayloadCache, RaiserArgs},
};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Declarative RabbitMQ consumer runtime
#[derive(Parser)]
#[command(name = "rabbitmq-runtime")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, env = "RABBITMQ_CONFIG", default_value = "rabbitmq.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one consumer until its lifetime expires
    Consume {
        /// Registered consumer id
        #[arg(long)]
        consumer: String,

        /// Registered handler id
        #[arg(long)]
        handler: String,

        /// Clone number
        #[arg(long, default_value_t = 1)]
        clone: u32,

        /// Lifetime in minutes
        #[arg(long, default_value_t = DEFAULT_LIFETIME_MINUTES, allow_negative_numbers = true)]
        lifetime: i64,

        /// Cache key of the launch payload
        #[arg(long)]
        payload: Option<String>,

        /// Directory of the payload cache
        #[arg(long)]
        payload_dir: Option<PathBuf>,
    },
    /// Print one command line per configured consumer clone
    Schedule,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let configs = RabbitMqConfigs::from_file(&cli.config)?;
    let factory = example::register(ConsumerFactory::new());
    factory.validate(&configs)?;

    match cli.command {
        Commands::Consume {
            consumer,
            handler,
            clone,
            lifetime,
            payload,
            payload_dir,
        } => {
            let cache = match payload_dir {
                Some(dir) => FilePayloadCache::new(dir),
                None => FilePayloadCache::default(),
            };
            let context = RuntimeContext::from_configs(configs)?;
            let raiser = ConsumerRaiser::new(factory, context, Arc::new(cache));

            let args = RaiserArgs {
                consumer,
                handler,
                clone,
                lifetime,
                payload_key: payload,
            };

            match raiser.run(&args).await? {
                ConsumerState::Failed => {
                    error!(consumer = args.consumer, "consumer loop failed");
                    Err(AmqpError::LoopFatalError(args.consumer).into())
                }
                state => {
                    info!(consumer = args.consumer, state = ?state, "consumer finished");
                    Ok(())
                }
            }
        }
        Commands::Schedule => {
            for launch in launch_plan(&configs) {
                println!("{}", launch.command_line("rabbitmq-runtime"));
            }
            Ok(())
        }
    }
}
