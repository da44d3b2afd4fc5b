// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport facade, used to run the client end to
//! end without a RabbitMQ server.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{types::FieldTable, BasicProperties};
use parking_lot::Mutex;
use rabbitmq_client::{
    config::RabbitMQConfigs,
    connection::Connection,
    errors::AmqpError,
    exchange::ExchangeKind,
    transport::{
        BrokerConfirm, ConfirmListener, Delivery, DeliveryStream, Envelope, ReturnListener,
        ReturnedMessage, Transport,
    },
};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc::{self, UnboundedSender};
use uuid::Uuid;

const NO_ROUTE: u16 = 312;

#[derive(Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    queue: String,
    auto_ack: bool,
    sender: UnboundedSender<Result<Delivery, AmqpError>>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, VecDeque<Message>>,
    bindings: Vec<(String, String, String)>,
    consumers: Vec<(String, Consumer)>,
    unacked: HashMap<u64, (String, Message)>,
    next_tag: u64,
    confirm_mode: bool,
    published: u64,
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.split_first(), words.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, words) || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some((&"*", rest)), Some((_, words))) => topic_matches(rest, words),
        (Some((word, rest)), Some((other, words))) => word == other && topic_matches(rest, words),
        _ => false,
    }
}

impl State {
    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default();
        }

        let kind = self.exchanges.get(exchange).copied().unwrap_or_default();
        let words: Vec<&str> = routing_key.split('.').collect();
        let mut targets: Vec<String> = vec![];

        for (queue, bound, key) in &self.bindings {
            let matched = bound == exchange
                && match kind {
                    ExchangeKind::Direct => key == routing_key,
                    ExchangeKind::Fanout | ExchangeKind::Headers => true,
                    ExchangeKind::Topic => {
                        let pattern: Vec<&str> = key.split('.').collect();
                        topic_matches(&pattern, &words)
                    }
                };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }

        targets
    }

    /// Hands ready messages of `queue` to its consumers, round robin.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let consumers: Vec<usize> = self
                .consumers
                .iter()
                .enumerate()
                .filter(|(_, (_, consumer))| consumer.queue == queue)
                .map(|(index, _)| index)
                .collect();
            let Some(&index) = consumers.first() else {
                return;
            };
            let Some(message) = self.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
                return;
            };

            self.next_tag += 1;
            let delivery_tag = self.next_tag;
            let (tag, consumer) = self.consumers.remove(index);
            let delivery = delivery(delivery_tag, &message);

            if consumer.sender.send(Ok(delivery)).is_err() {
                if let Some(ready) = self.queues.get_mut(queue) {
                    ready.push_front(message);
                }
                continue;
            }

            if !consumer.auto_ack {
                self.unacked.insert(delivery_tag, (queue.to_owned(), message));
            }
            self.consumers.push((tag, consumer));
        }
    }

    fn requeue(&mut self, queue: String, mut message: Message) {
        message.redelivered = true;
        if let Some(ready) = self.queues.get_mut(&queue) {
            ready.push_front(message);
        }
        self.dispatch(&queue);
    }
}

fn delivery(delivery_tag: u64, message: &Message) -> Delivery {
    Delivery {
        body: message.body.clone(),
        properties: message.properties.clone(),
        envelope: Envelope {
            delivery_tag,
            redelivered: message.redelivered,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
        },
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    returns: Mutex<Option<ReturnListener>>,
    confirms: Mutex<Option<ConfirmListener>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker::default())
    }

    /// Messages ready for delivery in `queue`.
    pub fn ready(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn unacked(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn bindings_of(&self, queue: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|(bound, _, _)| bound == queue)
            .map(|(_, exchange, key)| (exchange.clone(), key.clone()))
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn declare_queue(
        &self,
        name: &str,
        _durable: bool,
        _exclusive: bool,
        _auto_delete: bool,
        _args: FieldTable,
    ) -> Result<String, AmqpError> {
        let name = match name {
            "" => format!("amq.gen-{}", Uuid::new_v4()),
            name => name.to_owned(),
        };
        self.state.lock().queues.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
        _auto_delete: bool,
        _args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.state
            .lock()
            .exchanges
            .entry(name.to_owned())
            .or_insert(kind);
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        let binding = (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.state
            .lock()
            .bindings
            .retain(|(q, e, k)| !(q == queue && e == exchange && k == routing_key));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        _immediate: bool,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<(), AmqpError> {
        let (returned, confirm) = {
            let mut state = self.state.lock();
            if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
                return Err(AmqpError::PublishingError(format!("no exchange {}", exchange)));
            }

            let message = Message {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                properties,
                body,
                redelivered: false,
            };

            let targets = state.route(exchange, routing_key);
            let returned = (targets.is_empty() && mandatory).then(|| ReturnedMessage {
                reply_code: NO_ROUTE,
                reply_text: "NO_ROUTE".to_owned(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                body: message.body.clone(),
            });

            for queue in targets {
                if let Some(ready) = state.queues.get_mut(&queue) {
                    ready.push_back(message.clone());
                }
                state.dispatch(&queue);
            }

            let confirm = state.confirm_mode.then(|| {
                state.published += 1;
                BrokerConfirm::Ack {
                    delivery_tag: state.published,
                    multiple: false,
                }
            });

            (returned, confirm)
        };

        if let (Some(returned), Some(listener)) = (returned, self.returns.lock().clone()) {
            listener(returned);
        }
        if let (Some(confirm), Some(listener)) = (confirm, self.confirms.lock().clone()) {
            listener(confirm);
        }
        Ok(())
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>, AmqpError> {
        let mut state = self.state.lock();
        let Some(message) = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| AmqpError::GetMessageError(queue.to_owned()))?
            .pop_front()
        else {
            return Ok(None);
        };

        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        let delivery = delivery(delivery_tag, &message);
        if !no_ack {
            state.unacked.insert(delivery_tag, (queue.to_owned(), message));
        }

        Ok(Some(delivery))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        }
        state.consumers.push((
            consumer_tag.to_owned(),
            Consumer {
                queue: queue.to_owned(),
                auto_ack,
                sender,
            },
        ));
        state.dispatch(queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            let delivery = receiver.recv().await?;
            Some((delivery, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.state
            .lock()
            .consumers
            .retain(|(tag, _)| tag != consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, _multiple: bool) -> Result<(), AmqpError> {
        self.state
            .lock()
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| AmqpError::AckMessageError(delivery_tag.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.state.lock();
        let (queue, message) = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| AmqpError::RejectMessageError(delivery_tag.to_string()))?;

        if requeue {
            state.requeue(queue, message);
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.state.lock().confirm_mode = true;
        Ok(())
    }

    fn register_return_listener(&self, listener: Option<ReturnListener>) {
        *self.returns.lock() = listener;
    }

    fn register_confirm_listener(&self, listener: Option<ConfirmListener>) {
        *self.confirms.lock() = listener;
    }

    async fn purge(&self, queue: &str) -> Result<u32, AmqpError> {
        let mut state = self.state.lock();
        let ready = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| AmqpError::PurgeQueueError(queue.to_owned()))?;
        let purged = ready.len() as u32;
        ready.clear();
        Ok(purged)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        let mut state = self.state.lock();
        state.queues.remove(name);
        state.bindings.retain(|(queue, _, _)| queue != name);
        state.consumers.retain(|(_, consumer)| consumer.queue != name);
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        let mut state = self.state.lock();
        state.exchanges.remove(name);
        state.bindings.retain(|(_, exchange, _)| exchange != name);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state.lock().consumers.clear();
        Ok(())
    }
}

/// A connected client running over `broker`.
pub async fn connect(broker: &Arc<MemoryBroker>) -> Connection {
    let config = RabbitMQConfigs {
        feedback_timeout: Duration::from_millis(50),
        rpc_timeout: Duration::from_secs(2),
        ..Default::default()
    };

    match Connection::with_transport(config, broker.clone()).await {
        Ok(connection) => connection,
        Err(err) => panic!("memory connection failed: {err}"),
    }
}

/// Waits at most one second for the next item of `receiver`.
pub async fn next<T>(receiver: &mut mpsc::UnboundedReceiver<T>) -> T {
    match tokio::time::timeout(Duration::from_secs(1), receiver.recv()).await {
        Ok(Some(item)) => item,
        Ok(None) => panic!("channel closed"),
        Err(_) => panic!("nothing received in time"),
    }
}
