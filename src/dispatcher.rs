// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! This module runs the application handler for each delivery and converts its
//! outcome into a settlement (ack, nack with requeue, or nack without requeue).
//!
//! Failed messages are requeued until they exhaust the retry budget. Delivery tags
//! change on every redelivery, so attempts are taken from the broker's
//! `x-delivery-count` header when present and otherwise counted per message
//! fingerprint in a bounded in-memory tracker; once the budget is spent the message
//! is rejected without requeue, which drops it or routes it to the dead letter queue.

use crate::{
    broker::Message,
    events::{Event, EventSink},
    handler::{HandlerError, HandlerResult, MessageHandler},
    otel,
};
use futures_util::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    any::Any,
    borrow::Cow,
    collections::{HashMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};
use tracing::{debug, error, warn};

/// Default number of requeues granted to a failing message.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default number of message fingerprints remembered by the attempt tracker.
pub const DEFAULT_TRACKED_MESSAGES: usize = 10_000;

/// Broker action decided for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

/// How many times a failing message is requeued before it is rejected for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Attempt counts of requeued messages, per fingerprint, evicting the oldest
/// fingerprints first.
///
/// Every requeue leaves one pending count behind and every redelivery takes one
/// back, so copies of identical content each keep their own budget even though
/// they share a fingerprint.
struct AttemptTracker {
    capacity: usize,
    inner: Mutex<Attempts>,
}

#[derive(Default)]
struct Attempts {
    generation: u64,
    pending: HashMap<u64, (VecDeque<u32>, u64)>,
    order: VecDeque<(u64, u64)>,
}

impl AttemptTracker {
    fn new(capacity: usize) -> AttemptTracker {
        AttemptTracker {
            capacity: capacity.max(1),
            inner: Mutex::new(Attempts::default()),
        }
    }

    /// Takes back the count left by the requeue that caused this delivery.
    ///
    /// A first delivery (`redelivered == false`) never takes anything, it starts at 0.
    fn take(&self, msg: &Message) -> u32 {
        if !msg.redelivered {
            return 0;
        }

        let fingerprint = msg.fingerprint();
        let mut attempts = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some((counts, _)) = attempts.pending.get_mut(&fingerprint) else {
            return 0;
        };
        let count = counts.pop_front().unwrap_or(0);
        if counts.is_empty() {
            attempts.pending.remove(&fingerprint);
        }
        count
    }

    /// Leaves `count` behind for the redelivery of a requeued message.
    fn requeued(&self, msg: &Message, count: u32) {
        let fingerprint = msg.fingerprint();
        let mut attempts = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        attempts.generation += 1;
        let generation = attempts.generation;
        let entry = attempts
            .pending
            .entry(fingerprint)
            .or_insert_with(|| (VecDeque::new(), generation));
        entry.0.push_back(count);
        entry.1 = generation;
        attempts.order.push_back((fingerprint, generation));

        while attempts.pending.len() > self.capacity {
            let Some((oldest, generation)) = attempts.order.pop_front() else {
                break;
            };
            if attempts.pending.get(&oldest).map(|(_, g)| *g) == Some(generation) {
                attempts.pending.remove(&oldest);
            }
        }
        // Stale order entries pile up when the same message fails repeatedly.
        if attempts.order.len() > self.capacity * 2 {
            let Attempts { pending, order, .. } = &mut *attempts;
            order.retain(|(fp, g)| pending.get(fp).map(|(_, current)| current) == Some(g));
        }
    }

    fn tracked(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .values()
            .map(|(counts, _)| counts.len())
            .sum()
    }
}

/// Invokes the handler and applies the acknowledgement policy.
///
/// One dispatcher is shared by every worker of a consumer and survives reconnects,
/// so retry counts are kept across channel restarts.
pub struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
    retry: RetryPolicy,
    attempts: AttemptTracker,
    events: Arc<dyn EventSink>,
}

impl Dispatcher {
    /// Creates a new dispatcher.
    ///
    /// # Parameters
    /// * `handler` - Application handler run for every message
    /// * `retry` - Retry budget for failing messages
    /// * `events` - Sink receiving `handler_error` events
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        retry: RetryPolicy,
        events: Arc<dyn EventSink>,
    ) -> Dispatcher {
        Dispatcher {
            handler,
            retry,
            attempts: AttemptTracker::new(DEFAULT_TRACKED_MESSAGES),
            events,
        }
    }

    pub(crate) fn events(&self) -> Arc<dyn EventSink> {
        self.events.clone()
    }

    /// Runs the handler for one message and decides how to settle it.
    ///
    /// A panicking handler is treated like a failure; it never takes the worker
    /// or the channel down.
    pub async fn dispatch(&self, msg: &Message) -> Settlement {
        let tracer = global::tracer(otel::CONSUMER_TRACER);
        let (ctx, mut span) = otel::new_span(&msg.headers, &tracer, &msg.routing_key);

        debug!(
            delivery_tag = msg.delivery_tag,
            routing_key = %msg.routing_key,
            redelivered = msg.redelivered,
            "received message"
        );

        let outcome = match AssertUnwindSafe(async { self.handler.handle(&ctx, msg).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => HandlerResult::Fail(err),
            Err(panic) => HandlerResult::Fail(HandlerError::Panicked(panic_message(&panic))),
        };

        if let HandlerResult::Fail(err) = &outcome {
            span.record_error(err);
        }

        let settlement = self.settle(msg, outcome);
        match settlement {
            Settlement::Ack => span.set_status(Status::Ok),
            Settlement::Nack { requeue } => span.set_status(Status::Error {
                description: Cow::from(match requeue {
                    true => "message requeued",
                    false => "message rejected",
                }),
            }),
        }

        settlement
    }

    /// Maps a handler outcome to a settlement, updating the retry bookkeeping.
    pub fn settle(&self, msg: &Message, outcome: HandlerResult) -> Settlement {
        match outcome {
            HandlerResult::Ack => {
                debug!(delivery_tag = msg.delivery_tag, "message successfully processed");
                self.attempts.take(msg);
                Settlement::Ack
            }
            HandlerResult::Reject { requeue } => {
                debug!(delivery_tag = msg.delivery_tag, requeue, "message rejected by handler");
                let previous = self.attempts.take(msg);
                if requeue {
                    self.attempts.requeued(msg, previous);
                }
                Settlement::Nack { requeue }
            }
            HandlerResult::Fail(err) => {
                let previous = self.attempts.take(msg);
                let attempt = msg
                    .delivery_count()
                    .unwrap_or(previous)
                    .saturating_add(1);
                let exhausted = attempt > self.retry.max_retries;

                if exhausted {
                    error!(
                        delivery_tag = msg.delivery_tag,
                        attempt,
                        error = err.to_string(),
                        "too many attempts, rejecting message"
                    );
                } else {
                    self.attempts.requeued(msg, attempt);
                    warn!(
                        delivery_tag = msg.delivery_tag,
                        attempt,
                        error = err.to_string(),
                        "error whiling handling msg, requeuing for later"
                    );
                }

                self.events.emit(&Event::HandlerError {
                    delivery_tag: msg.delivery_tag,
                    attempt,
                    error: err.to_string(),
                    dead_lettered: exhausted,
                });

                Settlement::Nack {
                    requeue: !exhausted,
                }
            }
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
