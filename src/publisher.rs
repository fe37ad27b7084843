// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes messages to an exchange with a unique message id and the
//! current OpenTelemetry context injected into the headers, so the consumer side can
//! continue the trace and track retries by message id.

use crate::{
    broker::{Broker, BrokerChannel, MessageProperties},
    errors::AmqpError,
    events::EventSink,
    otel,
    topology::{TopologyDeclarator, TopologyDefinition},
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Publishes persistent messages on a channel.
pub struct Publisher {
    channel: Arc<dyn BrokerChannel>,
}

impl Publisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `channel` - A channel to the RabbitMQ server
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Publisher {
        Publisher { channel }
    }

    /// Publishes a message to `exchange` with `routing_key`.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context propagated in the message headers
    /// * `exchange` - Target exchange, the empty string being the default exchange
    /// * `routing_key` - Routing key of the message
    /// * `body` - Message payload
    ///
    /// # Returns
    /// The generated message id on success or AmqpError on failure
    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<String, AmqpError> {
        let mut headers = BTreeMap::new();
        otel::inject_context(ctx, &mut headers);

        let message_id = Uuid::new_v4().to_string();
        let properties = MessageProperties {
            message_id: Some(message_id.clone()),
            headers,
            persistent: true,
        };

        match self
            .channel
            .publish(exchange, routing_key, body, &properties)
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
                Err(err)
            }
            _ => {
                debug!(exchange, routing_key, message_id = %message_id, "message published");
                Ok(message_id)
            }
        }
    }
}

/// Sends one text message through its own connection.
///
/// The topology is declared first, which is a no-op when the consumer already did
/// it, so the message is routed even if it is sent before the consumer starts.
pub async fn send_greeting(
    broker: &dyn Broker,
    topology: &TopologyDefinition,
    events: Arc<dyn EventSink>,
    text: &str,
) -> Result<(), AmqpError> {
    let conn = broker.connect().await?;

    let result = async {
        TopologyDeclarator::new(events)
            .declare(conn.as_ref(), topology)
            .await?;

        let channel = conn.create_channel().await?;
        Publisher::new(channel.clone())
            .publish(
                &Context::current(),
                &topology.exchange.name,
                &topology.binding.routing_key,
                text.as_bytes(),
            )
            .await?;
        channel.close().await
    }
    .await;

    if let Err(err) = conn.close().await {
        debug!(error = err.to_string(), "failure to close the sender connection");
    }

    if result.is_ok() {
        info!(text, "Sending message...");
    }
    result
}
