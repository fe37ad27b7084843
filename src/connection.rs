// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! The [`ConnectionManager`] owns the single logical connection of the process.
//! It retries transient failures with exponential backoff, gives up immediately on
//! authentication or configuration errors, and hands out a [`LossSignal`] that
//! resolves when the broker connection breaks unexpectedly.

use crate::{
    backoff::Backoff,
    broker::{Broker, BrokerConnection},
    errors::{AmqpError, ErrorKind},
    events::{Event, EventSink},
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Failed connection attempts between two `warn` records; the others are `debug`.
const LOG_EVERY_N_ATTEMPTS: u32 = 10;

/// Resolves once the connection it was issued with is lost.
pub struct LossSignal {
    rx: mpsc::UnboundedReceiver<AmqpError>,
}

impl LossSignal {
    /// Waits for the connection to break and returns the cause.
    pub async fn lost(&mut self) -> AmqpError {
        self.rx
            .recv()
            .await
            .unwrap_or_else(|| AmqpError::ConnectionError("connection dropped".to_owned()))
    }
}

pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    backoff: Backoff,
    max_attempts: Option<u32>,
    events: Arc<dyn EventSink>,
    current: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    /// Creates a connection manager.
    ///
    /// # Parameters
    /// * `broker` - Broker used to open connections
    /// * `backoff` - Delay policy between failed attempts
    /// * `max_attempts` - Upper bound on attempts per `connect` call, `None` retries forever
    /// * `events` - Sink receiving `connected` events
    pub fn new(
        broker: Arc<dyn Broker>,
        backoff: Backoff,
        max_attempts: Option<u32>,
        events: Arc<dyn EventSink>,
    ) -> ConnectionManager {
        ConnectionManager {
            broker,
            backoff,
            max_attempts,
            events,
            current: Mutex::new(None),
        }
    }

    /// Opens a connection, retrying transient failures.
    ///
    /// Any previously opened connection is closed first, so at most one session is
    /// alive at a time.
    ///
    /// # Returns
    /// The live connection with its loss signal, or the first non-transient error
    /// (or the last transient one once `max_attempts` is exhausted).
    pub async fn connect(&self) -> Result<(Arc<dyn BrokerConnection>, LossSignal), AmqpError> {
        self.close().await;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            match self.broker.connect().await {
                Ok(conn) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    conn.on_loss(Box::new(move |err| {
                        let _ = tx.send(err);
                    }));

                    *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn.clone());

                    info!(attempt, "amqp connected");
                    self.events.emit(&Event::Connected { attempt });
                    return Ok((conn, LossSignal { rx }));
                }
                Err(err) if err.kind() != ErrorKind::Transient => {
                    error!(error = err.to_string(), attempt, "failure to connect, not retrying");
                    return Err(err);
                }
                Err(err) => {
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        error!(error = err.to_string(), attempt, "failure to connect, giving up");
                        return Err(err);
                    }

                    let delay = self.backoff.delay(attempt);
                    if attempt == 1 || attempt % LOG_EVERY_N_ATTEMPTS == 0 {
                        warn!(
                            error = err.to_string(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "failure to connect, retrying"
                        );
                    } else {
                        debug!(
                            error = err.to_string(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "failure to connect, retrying"
                        );
                    }

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Closes the live connection. Calling it again, or with no connection, is a no-op.
    pub async fn close(&self) {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner()).take();

        if let Some(conn) = current {
            debug!("closing amqp connection");
            if let Err(err) = conn.close().await {
                debug!(error = err.to_string(), "failure to close the connection");
            }
        }
    }
}
