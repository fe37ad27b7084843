// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Consumer
//!
//! This module provides the error type shared by every layer of the consumer.
//! The `AmqpError` enum represents all possible error scenarios that can occur during
//! connection, channel, topology and acknowledgement handling. Each error also carries
//! an [`ErrorKind`] which tells the supervisor whether to retry, recover or give up.

use thiserror::Error;

/// How an error must be treated by the layer that observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried in place with backoff (network failures while connecting).
    Transient,
    /// The channel or connection is gone; the supervisor rebuilds everything.
    Recoverable,
    /// Operator intervention required, the process stops.
    Fatal,
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// This enum covers all error scenarios for RabbitMQ interactions, including connection
/// issues, authentication, channel creation, exchange and queue declarations, consumer
/// registration and message settlement. Each variant provides specific context about
/// what operation failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// The configuration is invalid
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The broker refused the credentials or the virtual host
    #[error("access refused by the broker `{0}`")]
    AuthError(String),

    /// Error creating or using a channel
    #[error("channel failure `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// An existing exchange or queue was declared with incompatible properties
    #[error("topology conflict on `{0}`: {1}")]
    TopologyConflict(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(u64),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),
}

impl AmqpError {
    /// Classifies the error for the supervisor state machine.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AmqpError::ConnectionError(_) => ErrorKind::Transient,
            AmqpError::InternalError(_)
            | AmqpError::ConfigError(_)
            | AmqpError::AuthError(_)
            | AmqpError::TopologyConflict(_, _) => ErrorKind::Fatal,
            _ => ErrorKind::Recoverable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}
