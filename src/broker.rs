// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The consumer core talks to the broker through the object-safe traits defined here,
//! so the supervisor, declarator, consumer and dispatcher never see `lapin` types.
//! The production implementation lives in [`crate::channel`].

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap},
    hash::{Hash, Hasher},
    sync::Arc,
};

/// Header carrying the broker side redelivery count on quorum queues.
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Infinite stream of deliveries for one consumer; it ends with an error when the
/// underlying channel fails and cannot be restarted.
pub type DeliveryStream = BoxStream<'static, Result<Message, AmqpError>>;

/// Callback fired at most once when a connection is lost unexpectedly.
pub type LossCallback = Box<dyn Fn(AmqpError) + Send + Sync>;

/// A message delivered by the broker.
///
/// The `delivery_tag` is unique for the lifetime of the channel that delivered the
/// message and must be settled exactly once on that channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Message {
    pub fn new(delivery_tag: u64, routing_key: &str, body: &[u8]) -> Message {
        Message {
            body: body.to_vec(),
            delivery_tag,
            exchange: String::new(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            message_id: None,
            headers: BTreeMap::new(),
        }
    }

    /// Identity of the message across redeliveries.
    ///
    /// Delivery tags change on every redelivery, so retries are tracked by the
    /// publisher's message id when present, and by the routed content otherwise.
    /// Copies of the same content without a message id share a fingerprint and
    /// cannot be told apart once redelivered.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        match &self.message_id {
            Some(id) => id.hash(&mut hasher),
            None => {
                self.exchange.hash(&mut hasher);
                self.routing_key.hash(&mut hasher);
                self.body.hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    /// Number of earlier deliveries reported by the broker, when it counts them
    /// (`x-delivery-count`, set by quorum queues on redelivery).
    pub fn delivery_count(&self) -> Option<u32> {
        self.headers.get(DELIVERY_COUNT_HEADER)?.parse().ok()
    }
}

/// Properties attached to a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub persistent: bool,
}

/// Entry point to the broker: opens connections.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// One live session with the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Registers the callback fired when the connection breaks without being closed.
    fn on_loss(&self, callback: LossCallback);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// An AMQP channel. Implementations must accept concurrent calls, but the consumer
/// still funnels every settlement through a single writer.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// basic.consume with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
