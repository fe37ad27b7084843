// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Supervisor
//!
//! The [`Supervisor`] owns the lifecycle of the consumer: it connects, declares the
//! topology, subscribes and consumes, and when the connection or channel fails it
//! waits with backoff and starts over. Fatal errors (bad credentials or
//! configuration, a topology that conflicts with the broker, an exhausted connect
//! budget) stop it for good.
//!
//! ```text
//! Stopped -> Connecting -> Declaring -> Consuming
//!                ^                          |
//!                +------- Recovering <------+
//! ```

use crate::{
    backoff::Backoff,
    broker::{Broker, BrokerChannel, BrokerConnection, DeliveryStream},
    config::ConsumerConfig,
    connection::ConnectionManager,
    consumer::{shutdown_requested, Consumer},
    dispatcher::Dispatcher,
    errors::AmqpError,
    events::{Event, EventSink},
    handler::MessageHandler,
    topology::{TopologyDeclarator, TopologyDefinition},
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle states of the [`Supervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Connecting,
    Declaring,
    Consuming,
    Recovering,
    Fatal,
}

/// Drives connection, declaration and consumption, recovering from failures.
pub struct Supervisor {
    connections: ConnectionManager,
    declarator: TopologyDeclarator,
    topology: TopologyDefinition,
    consumer: Consumer,
    dispatcher: Arc<Dispatcher>,
    recovery: Backoff,
    events: Arc<dyn EventSink>,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    /// Creates a supervisor from already built components.
    pub fn new(
        connections: ConnectionManager,
        declarator: TopologyDeclarator,
        topology: TopologyDefinition,
        consumer: Consumer,
        dispatcher: Arc<Dispatcher>,
        recovery: Backoff,
        events: Arc<dyn EventSink>,
    ) -> Supervisor {
        let (state, _) = watch::channel(SupervisorState::Stopped);

        Supervisor {
            connections,
            declarator,
            topology,
            consumer,
            dispatcher,
            recovery,
            events,
            state,
        }
    }

    /// Wires every component from the configuration.
    ///
    /// # Parameters
    /// * `config` - Validated consumer configuration
    /// * `broker` - Broker used to open connections
    /// * `handler` - Application handler run for every message
    /// * `events` - Sink receiving the observability events
    ///
    /// # Returns
    /// The supervisor, or `ConfigError` when the configuration is unusable
    pub fn from_config(
        config: &ConsumerConfig,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn MessageHandler>,
        events: Arc<dyn EventSink>,
    ) -> Result<Supervisor, AmqpError> {
        config.validate()?;

        let topology = config.topology_definition();
        let connections = ConnectionManager::new(
            broker,
            config.backoff(),
            config.amqp.max_connect_attempts,
            events.clone(),
        );
        let consumer = Consumer::new(
            &topology.queue.name,
            config.topology.prefetch,
            config.shutdown_grace(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            handler,
            config.retry_policy(),
            events.clone(),
        ));

        Ok(Supervisor::new(
            connections,
            TopologyDeclarator::new(events.clone()),
            topology,
            consumer,
            dispatcher,
            config.backoff(),
            events,
        ))
    }

    /// Watches the current state; the receiver sees every later transition.
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Runs until shutdown is requested or a fatal error occurs.
    ///
    /// # Parameters
    /// * `shutdown` - Set to `true` to stop gracefully
    ///
    /// # Returns
    /// Ok(()) once `Stopped`, or the fatal cause once `Fatal`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AmqpError> {
        let mut failures: u32 = 0;

        let result = loop {
            self.transition(SupervisorState::Connecting);

            // The connection manager retries transient failures itself, anything it
            // returns is final.
            let (conn, mut lost) = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break Ok(()),
                conn = self.connections.connect() => match conn {
                    Ok(conn) => conn,
                    Err(err) => break Err(err),
                },
            };

            self.transition(SupervisorState::Declaring);

            let session = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break Ok(()),
                err = lost.lost() => Err(err),
                session = self.open_session(conn.as_ref()) => session,
            };

            let cause = match session {
                Ok((channel, deliveries)) => {
                    self.transition(SupervisorState::Consuming);
                    failures = 0;

                    match self
                        .consumer
                        .consume(
                            channel,
                            deliveries,
                            self.dispatcher.clone(),
                            &mut shutdown,
                            &mut lost,
                        )
                        .await
                    {
                        Ok(()) => break Ok(()),
                        Err(err) => err,
                    }
                }
                Err(err) => err,
            };

            if cause.is_fatal() {
                break Err(cause);
            }

            self.events.emit(&Event::Disconnected {
                reason: cause.to_string(),
            });
            self.transition(SupervisorState::Recovering);

            failures = failures.saturating_add(1);
            let delay = self.recovery.delay(failures);
            warn!(
                error = cause.to_string(),
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "consumer interrupted, recovering"
            );

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.connections.close().await;

        match &result {
            Ok(()) => {
                info!("consumer stopped");
                self.transition(SupervisorState::Stopped);
            }
            Err(err) => {
                error!(error = err.to_string(), "fatal error, consumer stopped");
                self.transition(SupervisorState::Fatal);
            }
        }

        result
    }

    /// Declares the topology and subscribes on a fresh channel.
    async fn open_session(
        &self,
        conn: &dyn BrokerConnection,
    ) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), AmqpError> {
        self.declarator.declare(conn, &self.topology).await?;

        let channel = conn.create_channel().await?;
        let deliveries = self.consumer.subscribe(channel.as_ref()).await?;
        Ok((channel, deliveries))
    }

    fn transition(&self, to: SupervisorState) {
        let from = self.state.send_replace(to);
        if from == to {
            return;
        }

        debug!(?from, ?to, "supervisor state changed");
        self.events.emit(&Event::StateChanged { from, to });
    }
}

/// Process exit status for the outcome of [`Supervisor::run`]: 0 when stopped
/// gracefully, 1 after a fatal error.
pub fn exit_status(result: &Result<(), AmqpError>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}
