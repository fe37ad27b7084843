// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! A supervised RabbitMQ consumer.
//!
//! The [`supervisor::Supervisor`] keeps one connection alive, declares the configured
//! exchange, queue and binding, and feeds every delivery to an application
//! [`handler::MessageHandler`] with manual acknowledgement, bounded retries and
//! automatic recovery from broker outages.

mod otel;

pub mod backoff;
pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod publisher;
pub mod queue;
pub mod supervisor;
pub mod topology;

#[cfg(test)]
mod testing;
