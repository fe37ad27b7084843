// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! It routes direct, fanout and topic publishes, honours basic.qos, records every
//! settlement, flags double or unknown settlements, and can refuse credentials,
//! fail connects or drop every live connection on demand.

use crate::{
    broker::{
        Broker, BrokerChannel, BrokerConnection, DeliveryStream, LossCallback, Message,
        MessageProperties,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settled {
    Ack { channel: u64, tag: u64 },
    Nack { channel: u64, tag: u64, requeue: bool },
}

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    message_id: Option<String>,
    headers: BTreeMap<String, String>,
}

struct FakeQueue {
    def: QueueDefinition,
    ready: VecDeque<Stored>,
}

struct ChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Stored)>,
}

struct ConnectionState {
    open: bool,
    callbacks: Vec<LossCallback>,
}

#[derive(Default)]
struct State {
    fail_connects: u32,
    refuse_auth: bool,
    connect_attempts: u32,
    next_id: u64,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, FakeQueue>,
    bindings: Vec<QueueBinding>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    settlements: Vec<Settled>,
    invalid_settlements: u32,
    dropped: Vec<Vec<u8>>,
    max_outstanding: usize,
}

impl State {
    /// Closes a channel; its unacknowledged messages go back to their queues.
    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        let unacked = std::mem::take(&mut channel.unacked);

        for (_, (queue, mut stored)) in unacked.into_iter().rev() {
            stored.redelivered = true;
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_front(stored);
            }
        }
    }

    fn close_connection(&mut self, id: u64) -> Vec<LossCallback> {
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection == id)
            .map(|(id, _)| *id)
            .collect();
        for channel in channel_ids {
            self.close_channel(channel);
        }

        match self.connections.get_mut(&id) {
            Some(conn) if conn.open => {
                conn.open = false;
                std::mem::take(&mut conn.callbacks)
            }
            _ => vec![],
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, stored: Stored) -> Result<(), AmqpError> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            let def = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| AmqpError::PublishingError(format!("no exchange {exchange}")))?;
            self.bindings
                .iter()
                .filter(|b| b.exchange_name == exchange)
                .filter(|b| match def.kind {
                    ExchangeKind::Direct => b.routing_key == routing_key,
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                    ExchangeKind::Headers => false,
                })
                .map(|b| b.queue_name.clone())
                .collect()
        };

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.ready.push_back(stored.clone());
            }
        }
        Ok(())
    }

    fn open_channel(&mut self, id: u64) -> Result<&mut ChannelState, AmqpError> {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.open => Ok(channel),
            _ => Err(AmqpError::ChannelError(format!("channel {id} is closed"))),
        }
    }

    /// Hands the next ready message of `queue` to the channel, if qos allows it.
    fn next_delivery(&mut self, id: u64, queue: &str) -> Option<Result<Message, AmqpError>> {
        let channel = match self.channels.get(&id) {
            Some(channel) if channel.open => channel,
            _ => return Some(Err(AmqpError::ChannelError("channel closed".to_owned()))),
        };
        if channel.prefetch > 0 && channel.unacked.len() >= channel.prefetch as usize {
            return None;
        }

        let stored = self.queues.get_mut(queue)?.ready.pop_front()?;
        let channel = self.channels.get_mut(&id)?;
        channel.next_tag += 1;
        let tag = channel.next_tag;
        channel.unacked.insert(tag, (queue.to_owned(), stored.clone()));
        self.max_outstanding = self.max_outstanding.max(channel.unacked.len());

        Some(Ok(Message {
            body: stored.body,
            delivery_tag: tag,
            exchange: stored.exchange,
            routing_key: stored.routing_key,
            redelivered: stored.redelivered,
            message_id: stored.message_id,
            headers: stored.headers,
        }))
    }

    fn settle(&mut self, id: u64, tag: u64, requeue: Option<bool>) -> Result<(), AmqpError> {
        let channel = self.open_channel(id)?;
        let Some((queue, mut stored)) = channel.unacked.remove(&tag) else {
            // The broker answers PRECONDITION_FAILED and closes the channel.
            self.invalid_settlements += 1;
            self.close_channel(id);
            return Err(AmqpError::ChannelError(format!("unknown delivery tag {tag}")));
        };

        match requeue {
            None => self.settlements.push(Settled::Ack { channel: id, tag }),
            Some(requeue) => {
                self.settlements.push(Settled::Nack {
                    channel: id,
                    tag,
                    requeue,
                });
                let dlq = self.queues.get(&queue).and_then(|q| q.def.dlq_name.clone());
                if requeue {
                    stored.redelivered = true;
                    if let Some(q) = self.queues.get_mut(&queue) {
                        q.ready.push_front(stored);
                    }
                } else {
                    let target = match &dlq {
                        Some(name) => self.queues.get_mut(name),
                        None => None,
                    };
                    match target {
                        Some(q) => q.ready.push_back(stored),
                        None => self.dropped.push(stored.body),
                    }
                }
            }
        }
        Ok(())
    }
}

/// AMQP topic pattern matching: `*` is one word, `#` is zero or more words.
pub(crate) fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    pub(crate) fn new() -> FakeBroker {
        FakeBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// The next `n` connects fail with a transient error.
    pub(crate) fn fail_next_connects(&self, n: u32) {
        self.state().fail_connects = n;
    }

    pub(crate) fn refuse_auth(&self) {
        self.state().refuse_auth = true;
    }

    pub(crate) fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// Simulates a broker restart or network partition.
    ///
    /// Loss callbacks fire before the lock is released, so consumers learn about the
    /// lost connection before their delivery streams fail.
    pub(crate) fn drop_connections(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        let callbacks: Vec<LossCallback> = ids
            .into_iter()
            .flat_map(|id| state.close_connection(id))
            .collect();
        for callback in callbacks {
            callback(AmqpError::ConnectionError("connection reset by peer".to_owned()));
        }
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.state().connections.values().filter(|c| c.open).count()
    }

    /// Declares a queue as if another application had created it earlier.
    pub(crate) fn existing_queue(&self, def: QueueDefinition) {
        self.state().queues.insert(
            def.name.clone(),
            FakeQueue {
                def,
                ready: VecDeque::new(),
            },
        );
    }

    pub(crate) fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) {
        let stored = Stored {
            body: body.to_vec(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            message_id: None,
            headers: BTreeMap::new(),
        };
        self.state().route(exchange, routing_key, stored).unwrap();
    }

    pub(crate) fn settlements(&self) -> Vec<Settled> {
        self.state().settlements.clone()
    }

    pub(crate) fn acks(&self) -> usize {
        self.settlements()
            .iter()
            .filter(|s| matches!(s, Settled::Ack { .. }))
            .count()
    }

    pub(crate) fn invalid_settlements(&self) -> u32 {
        self.state().invalid_settlements
    }

    pub(crate) fn max_outstanding(&self) -> usize {
        self.state().max_outstanding
    }

    pub(crate) fn ready(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub(crate) fn unacked(&self) -> usize {
        self.state().channels.values().map(|c| c.unacked.len()).sum()
    }

    pub(crate) fn dropped(&self) -> Vec<Vec<u8>> {
        self.state().dropped.clone()
    }

    pub(crate) fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.state().queues.get(name).map(|q| q.def.clone())
    }

    pub(crate) fn bindings(&self) -> usize {
        self.state().bindings.len()
    }

    pub(crate) fn exchanges(&self) -> usize {
        self.state().exchanges.len()
    }

    /// Polls `condition` until it holds, panicking after two seconds.
    pub(crate) async fn wait_for(&self, what: &str, condition: impl Fn(&FakeBroker) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !condition(self) {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.state();
        state.connect_attempts += 1;

        if state.refuse_auth {
            return Err(AmqpError::AuthError("ACCESS_REFUSED".to_owned()));
        }
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                callbacks: vec![],
            },
        );

        Ok(Arc::new(FakeConnection {
            id,
            state: self.state.clone(),
        }))
    }
}

struct FakeConnection {
    id: u64,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.state.lock().unwrap();
        if !state.connections.get(&self.id).is_some_and(|c| c.open) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );

        Ok(Arc::new(FakeChannel {
            id,
            state: self.state.clone(),
        }))
    }

    fn on_loss(&self, callback: LossCallback) {
        if let Some(conn) = self.state.lock().unwrap().connections.get_mut(&self.id) {
            conn.callbacks.push(callback);
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        // A graceful close never fires the loss callbacks.
        let _ = self.state.lock().unwrap().close_connection(self.id);
        Ok(())
    }
}

struct FakeChannel {
    id: u64,
    state: Arc<Mutex<State>>,
}

impl FakeChannel {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.open_channel(self.id)?;

        let conflict = state
            .exchanges
            .get(&def.name)
            .map(|existing| existing.kind != def.kind || existing.durable != def.durable);

        match conflict {
            Some(true) => {
                state.close_channel(self.id);
                Err(AmqpError::TopologyConflict(
                    def.name.clone(),
                    "inequivalent arg".to_owned(),
                ))
            }
            Some(false) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.open_channel(self.id)?;

        let conflict = state.queues.get(&def.name).map(|existing| existing.def != *def);

        match conflict {
            Some(true) => {
                state.close_channel(self.id);
                Err(AmqpError::TopologyConflict(
                    def.name.clone(),
                    "inequivalent arg 'durable'".to_owned(),
                ))
            }
            Some(false) => Ok(()),
            None => {
                state.queues.insert(
                    def.name.clone(),
                    FakeQueue {
                        def: def.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.open_channel(self.id)?;

        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            state.close_channel(self.id);
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.state().open_channel(self.id)?.prefetch = prefetch;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        {
            let mut state = self.state();
            state.open_channel(self.id)?;
            if !state.queues.contains_key(queue) {
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let state = self.state.clone();
        let (id, queue) = (self.id, queue.to_owned());

        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    return;
                }
                let next = state.lock().unwrap().next_delivery(id, &queue);
                match next {
                    Some(Ok(msg)) => {
                        if tx.send(Ok(msg)).is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                    None => tokio::time::sleep(Duration::from_millis(1)).await,
                }
            }
        });

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.state().settle(self.id, delivery_tag, None)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.state().settle(self.id, delivery_tag, Some(requeue))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.open_channel(self.id)?;
        let stored = Stored {
            body: body.to_vec(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            message_id: properties.message_id.clone(),
            headers: properties.headers.clone(),
        };
        state.route(exchange, routing_key, stored)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("orders.#", "orders.created"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("#.eu", "orders.created.eu"));
        assert!(!topic_matches("orders.#", "invoices.created"));
        assert!(topic_matches("spring-boot5", "spring-boot5"));
    }
}
