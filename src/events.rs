// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Observability Events
//!
//! Structured events emitted by the consumer core. They are handed to an
//! [`EventSink`]; the default sink writes them through `tracing`, while
//! applications may forward them to metrics or alerting.

use crate::supervisor::SupervisorState;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected {
        attempt: u32,
    },
    Disconnected {
        reason: String,
    },
    Declared {
        exchange: String,
        queue: String,
        routing_key: String,
    },
    MessageAcked {
        delivery_tag: u64,
    },
    MessageRejected {
        delivery_tag: u64,
        requeue: bool,
    },
    HandlerError {
        delivery_tag: u64,
        attempt: u32,
        error: String,
        dead_lettered: bool,
    },
    StateChanged {
        from: SupervisorState,
        to: SupervisorState,
    },
}

/// Receiver of [`Event`]s.
#[cfg_attr(test, automock)]
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Writes every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &Event) {
        match event {
            Event::Connected { attempt } => info!(attempt, "connected to broker"),
            Event::Disconnected { reason } => warn!(reason = %reason, "disconnected from broker"),
            Event::Declared {
                exchange,
                queue,
                routing_key,
            } => info!(%exchange, %queue, %routing_key, "topology declared"),
            Event::MessageAcked { delivery_tag } => debug!(delivery_tag, "message acked"),
            Event::MessageRejected {
                delivery_tag,
                requeue,
            } => debug!(delivery_tag, requeue, "message rejected"),
            // The dispatcher already logs failures with their context.
            Event::HandlerError {
                delivery_tag,
                attempt,
                dead_lettered,
                ..
            } => debug!(delivery_tag, attempt, dead_lettered, "handler error"),
            Event::StateChanged { from, to } => info!(?from, ?to, "supervisor state changed"),
        }
    }
}
