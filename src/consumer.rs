// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module subscribes to the configured queue and feeds every delivery to the
//! [`Dispatcher`]. Handlers run concurrently, at most `prefetch` at a time, while
//! every ack and nack of a channel is written by one task so that a delivery tag is
//! settled exactly once and on the channel that delivered it.

use crate::{
    broker::{BrokerChannel, DeliveryStream},
    connection::LossSignal,
    dispatcher::{Dispatcher, Settlement},
    errors::AmqpError,
    events::{Event, EventSink},
};
use futures_util::StreamExt;
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default time given to in-flight handlers once shutdown is requested.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Subscribes to one queue and runs the handler for each delivery.
pub struct Consumer {
    queue: String,
    prefetch: u16,
    grace: Duration,
}

impl Consumer {
    /// Creates a new consumer.
    ///
    /// # Parameters
    /// * `queue` - Name of the queue to consume from
    /// * `prefetch` - Maximum number of unacknowledged deliveries on the channel
    /// * `grace` - How long shutdown waits for in-flight handlers
    pub fn new(queue: &str, prefetch: u16, grace: Duration) -> Consumer {
        Consumer {
            queue: queue.to_owned(),
            prefetch,
            grace,
        }
    }

    /// Applies the prefetch limit and starts a manual-ack subscription.
    ///
    /// A prefetch of 0 means "unbounded" to the broker and is refused.
    pub async fn subscribe(&self, channel: &dyn BrokerChannel) -> Result<DeliveryStream, AmqpError> {
        if self.prefetch == 0 {
            return Err(AmqpError::ConfigError("prefetch must be greater than 0".to_owned()));
        }

        channel.qos(self.prefetch).await?;

        let consumer_tag = Uuid::new_v4().to_string();
        let deliveries = channel.consume(&self.queue, &consumer_tag).await?;

        info!(
            queue = %self.queue,
            consumer_tag = %consumer_tag,
            prefetch = self.prefetch,
            "consumer subscribed"
        );

        Ok(deliveries)
    }

    /// Consumes deliveries until shutdown is requested or the channel fails.
    ///
    /// # Parameters
    /// * `channel` - The channel the subscription was opened on
    /// * `deliveries` - The stream returned by [`Consumer::subscribe`]
    /// * `dispatcher` - Runs the handler and decides each settlement
    /// * `shutdown` - Set to `true` to stop consuming gracefully
    /// * `lost` - Resolves when the underlying connection breaks
    ///
    /// # Returns
    /// Ok(()) after a graceful shutdown, otherwise the error that ended the
    /// subscription.
    pub async fn consume(
        &self,
        channel: Arc<dyn BrokerChannel>,
        mut deliveries: DeliveryStream,
        dispatcher: Arc<Dispatcher>,
        shutdown: &mut watch::Receiver<bool>,
        lost: &mut LossSignal,
    ) -> Result<(), AmqpError> {
        let in_flight = Arc::new(InFlight::new(self.prefetch));
        let (acks, writer) =
            AckWriter::spawn(channel.clone(), in_flight.clone(), dispatcher.events());
        let workers = Arc::new(Semaphore::new(self.prefetch as usize));

        let outcome = loop {
            // A worker slot is reserved before the next delivery is taken, so a
            // message never waits in memory for a free worker.
            let permit = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => break Ok(()),
                err = lost.lost() => break Err(err),
                permit = workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(AmqpError::InternalError("worker pool closed".to_owned())),
                },
            };

            let next = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => break Ok(()),
                err = lost.lost() => break Err(err),
                next = deliveries.next() => next,
            };

            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(err)) => break Err(err),
                None => break Err(AmqpError::ChannelError("consumer cancelled by broker".to_owned())),
            };

            in_flight.begin(msg.delivery_tag);

            let dispatcher = dispatcher.clone();
            let acks = acks.clone();
            tokio::spawn(async move {
                let settlement = dispatcher.dispatch(&msg).await;
                acks.settle(msg.delivery_tag, settlement);
                drop(permit);
            });
        };

        drop(deliveries);

        match &outcome {
            Ok(()) => {
                info!(queue = %self.queue, "shutdown requested, draining in-flight messages");
                drop(acks);
                if self.drain(&workers, &in_flight).await {
                    if let Err(err) = writer.await {
                        error!(error = err.to_string(), "ack writer failed");
                    }
                } else {
                    writer.abort();
                }
                if let Err(err) = channel.close().await {
                    debug!(error = err.to_string(), "failure to close the consumer channel");
                }
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    queue = %self.queue,
                    outstanding = in_flight.outstanding(),
                    "consumer stopped"
                );
                // The broker requeues whatever is unsettled once the channel is gone.
                writer.abort();
            }
        }

        debug!(high_water = in_flight.high_water(), "consumer finished");
        outcome
    }

    /// Waits up to the grace period for every worker to finish; false on timeout.
    async fn drain(&self, workers: &Semaphore, in_flight: &InFlight) -> bool {
        let all = u32::from(self.prefetch);

        match tokio::time::timeout(self.grace, workers.acquire_many(all)).await {
            Ok(_) => {
                debug!("in-flight messages drained");
                true
            }
            Err(_) => {
                warn!(
                    outstanding = in_flight.outstanding(),
                    grace_ms = self.grace.as_millis() as u64,
                    "grace period elapsed, unsettled messages are left to the broker"
                );
                false
            }
        }
    }
}

/// Resolves once shutdown is requested. A dropped sender never requests it.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Ledger of delivered but not yet settled tags of one channel.
pub(crate) struct InFlight {
    prefetch: usize,
    inner: Mutex<Ledger>,
}

#[derive(Default)]
struct Ledger {
    tags: BTreeSet<u64>,
    last_tag: u64,
    high_water: usize,
}

impl InFlight {
    pub(crate) fn new(prefetch: u16) -> InFlight {
        InFlight {
            prefetch: prefetch as usize,
            inner: Mutex::new(Ledger::default()),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a new delivery.
    pub(crate) fn begin(&self, tag: u64) {
        let mut ledger = self.ledger();

        if tag <= ledger.last_tag {
            error!(
                delivery_tag = tag,
                last_tag = ledger.last_tag,
                "delivery tags out of order"
            );
        }
        ledger.last_tag = ledger.last_tag.max(tag);
        ledger.tags.insert(tag);

        let outstanding = ledger.tags.len();
        if outstanding > self.prefetch {
            error!(outstanding, prefetch = self.prefetch, "broker exceeded the prefetch limit");
        }
        ledger.high_water = ledger.high_water.max(outstanding);
    }

    /// Marks a delivery as settled; false if it was unknown or already settled.
    pub(crate) fn complete(&self, tag: u64) -> bool {
        self.ledger().tags.remove(&tag)
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.ledger().tags.len()
    }

    pub(crate) fn high_water(&self) -> usize {
        self.ledger().high_water
    }
}

/// Handle used by workers to queue a settlement for the writer.
#[derive(Clone)]
struct AckSender {
    tx: mpsc::UnboundedSender<(u64, Settlement)>,
}

impl AckSender {
    fn settle(&self, tag: u64, settlement: Settlement) {
        if self.tx.send((tag, settlement)).is_err() {
            debug!(delivery_tag = tag, "ack writer stopped, leaving message to the broker");
        }
    }
}

/// The only writer of acks and nacks on a channel.
struct AckWriter {
    channel: Arc<dyn BrokerChannel>,
    in_flight: Arc<InFlight>,
    events: Arc<dyn EventSink>,
}

impl AckWriter {
    fn spawn(
        channel: Arc<dyn BrokerChannel>,
        in_flight: Arc<InFlight>,
        events: Arc<dyn EventSink>,
    ) -> (AckSender, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = AckWriter {
            channel,
            in_flight,
            events,
        };

        (AckSender { tx }, tokio::spawn(writer.run(rx)))
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<(u64, Settlement)>) {
        while let Some((tag, settlement)) = rx.recv().await {
            if !self.in_flight.complete(tag) {
                error!(delivery_tag = tag, "refusing to settle an unknown or settled delivery");
                continue;
            }

            let result = match settlement {
                Settlement::Ack => self
                    .channel
                    .ack(tag)
                    .await
                    .map(|_| Event::MessageAcked { delivery_tag: tag }),
                Settlement::Nack { requeue } => {
                    self.channel
                        .nack(tag, requeue)
                        .await
                        .map(|_| Event::MessageRejected {
                            delivery_tag: tag,
                            requeue,
                        })
                }
            };

            match result {
                Ok(event) => self.events.emit(&event),
                Err(err) => {
                    error!(error = err.to_string(), delivery_tag = tag, "failure to settle message")
                }
            }
        }
    }
}
