// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use clap::Parser;
use opentelemetry::Context;
use rabbitmq_consumer::{
    broker::Message,
    channel::AmqpBroker,
    config::{Args, ConsumerConfig},
    events::{EventSink, TracingEventSink},
    handler::{HandlerError, HandlerResult, MessageHandler},
    logging,
    publisher::send_greeting,
    supervisor::{exit_status, Supervisor},
};
use std::{process::ExitCode, sync::Arc};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Prints every text message delivered to the queue.
struct Receiver;

#[async_trait]
impl MessageHandler for Receiver {
    async fn handle(&self, _ctx: &Context, msg: &Message) -> Result<HandlerResult, HandlerError> {
        match std::str::from_utf8(&msg.body) {
            Ok(text) => {
                info!("Received <{}>", text);
                Ok(HandlerResult::Ack)
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    delivery_tag = msg.delivery_tag,
                    "discarding a message that is not UTF-8 text"
                );
                Ok(HandlerResult::Reject { requeue: false })
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_format);

    let config = match ConsumerConfig::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("rabbitmq-consumer: {err}");
            return ExitCode::from(1);
        }
    };

    let broker = Arc::new(AmqpBroker::new(&config.amqp.uri, &config.amqp.connection_name));
    let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);

    let supervisor = match Supervisor::from_config(
        &config,
        broker.clone(),
        Arc::new(Receiver),
        events.clone(),
    ) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            eprintln!("rabbitmq-consumer: {err}");
            return ExitCode::from(1);
        }
    };

    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = err.to_string(), "failure to listen for ctrl-c");
            return;
        }
        info!("interrupt received, shutting down");
        let _ = shutdown.send(true);
    });

    if let Some(text) = args.send.clone() {
        let topology = config.topology_definition();
        tokio::spawn(async move {
            if let Err(err) = send_greeting(broker.as_ref(), &topology, events, &text).await {
                error!(error = err.to_string(), "failure to send message");
            }
        });
    }

    info!(
        queue = %config.topology.queue_name,
        exchange = %config.topology.exchange_name,
        routing_key = %config.topology.routing_key,
        "starting consumer"
    );

    let result = supervisor.run(shutdown_rx).await;
    if let Err(err) = &result {
        eprintln!("rabbitmq-consumer: fatal: {err}");
    }

    ExitCode::from(exit_status(&result))
}
