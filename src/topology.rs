// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the broker resources the consumer depends on: one exchange,
//! one queue (plus its dead letter queue when configured) and the binding between
//! them. Declarations are idempotent, so the topology is installed again after every
//! reconnect.

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    errors::AmqpError,
    events::{Event, EventSink},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use std::sync::Arc;
use tracing::{debug, error};

/// The exchange, queue and binding a consumer depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDefinition {
    pub exchange: ExchangeDefinition,
    pub queue: QueueDefinition,
    pub binding: QueueBinding,
}

impl TopologyDefinition {
    /// Builds a topology binding `queue` to `exchange` with `routing_key`.
    pub fn new(exchange: ExchangeDefinition, queue: QueueDefinition, routing_key: &str) -> Self {
        let binding = QueueBinding::new(&queue.name)
            .exchange(&exchange.name)
            .routing_key(routing_key);

        TopologyDefinition {
            exchange,
            queue,
            binding,
        }
    }

    /// Checks the definition before anything is sent to the broker.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.queue.name.is_empty() {
            return Err(AmqpError::ConfigError("queue name must not be empty".to_owned()));
        }
        if self.exchange.name.is_empty() {
            return Err(AmqpError::ConfigError(
                "exchange name must not be empty, the default exchange cannot be bound".to_owned(),
            ));
        }
        if self.binding.routing_key.is_empty() {
            return Err(AmqpError::ConfigError("routing key must not be empty".to_owned()));
        }
        Ok(())
    }
}

/// Installs a [`TopologyDefinition`] on a live connection.
pub struct TopologyDeclarator {
    events: Arc<dyn EventSink>,
}

impl TopologyDeclarator {
    pub fn new(events: Arc<dyn EventSink>) -> TopologyDeclarator {
        TopologyDeclarator { events }
    }

    /// Declares the topology on a dedicated, short-lived channel.
    ///
    /// This method performs the following operations in order:
    /// 1. Declares the exchange
    /// 2. Declares the dead letter queue, if any
    /// 3. Declares the queue
    /// 4. Binds the queue to the exchange
    ///
    /// # Parameters
    /// * `conn` - A live broker connection
    /// * `def` - The topology to install
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure. A definition that conflicts with
    /// what already exists on the broker yields `TopologyConflict`.
    pub async fn declare(
        &self,
        conn: &dyn BrokerConnection,
        def: &TopologyDefinition,
    ) -> Result<(), AmqpError> {
        def.validate()?;

        let channel = conn.create_channel().await?;
        let result = self.install(channel.as_ref(), def).await;

        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "failure to close the declaration channel");
        }

        if let Err(err) = &result {
            error!(
                error = err.to_string(),
                exchange = %def.exchange.name,
                queue = %def.queue.name,
                "failure to declare topology"
            );
            return result;
        }

        self.events.emit(&Event::Declared {
            exchange: def.exchange.name.clone(),
            queue: def.queue.name.clone(),
            routing_key: def.binding.routing_key.clone(),
        });

        Ok(())
    }

    async fn install(
        &self,
        channel: &dyn BrokerChannel,
        def: &TopologyDefinition,
    ) -> Result<(), AmqpError> {
        debug!("creating {} exchange: {}", def.exchange.kind, def.exchange.name);
        channel.declare_exchange(&def.exchange).await?;

        if let Some(dlq) = def.queue.dlq_definition() {
            debug!("creating dead letter queue: {}", dlq.name);
            channel.declare_queue(&dlq).await?;
        }

        debug!("creating queue: {}", def.queue.name);
        channel.declare_queue(&def.queue).await?;

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            def.binding.queue_name, def.binding.exchange_name, def.binding.routing_key
        );
        channel.bind_queue(&def.binding).await
    }
}
