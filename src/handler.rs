// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! The application plugs its business logic into the consumer through the
//! [`MessageHandler`] trait. A handler reports what should happen to the message
//! through a [`HandlerResult`]; returning an error is the same as `Fail`.

use crate::broker::Message;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use opentelemetry::Context;
use std::future::Future;
use thiserror::Error;

/// Outcome of one handler invocation.
#[derive(Debug)]
pub enum HandlerResult {
    /// Processed, remove the message from the queue.
    Ack,
    /// Refused by the handler; `requeue` asks the broker to deliver it again.
    Reject { requeue: bool },
    /// Processing failed; retried until the retry budget is exhausted.
    Fail(HandlerError),
}

/// Failure raised by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> HandlerError {
        HandlerError::Failed(msg.into())
    }
}

/// Application callback invoked once per delivered message.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles one message.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context extracted from the message headers
    /// * `msg` - The delivered message
    async fn handle(&self, ctx: &Context, msg: &Message) -> Result<HandlerResult, HandlerError>;
}

/// Adapts an async function into a [`MessageHandler`]; see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Builds a handler from an async function taking the message by value.
///
/// ```
/// use rabbitmq_consumer::handler::{handler_fn, HandlerResult};
///
/// let handler = handler_fn(|msg| async move {
///     println!("received {} bytes", msg.body.len());
///     Ok(HandlerResult::Ack)
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerResult, HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerResult, HandlerError>> + Send,
{
    async fn handle(&self, _ctx: &Context, msg: &Message) -> Result<HandlerResult, HandlerError> {
        (self.f)(msg.clone()).await
    }
}
