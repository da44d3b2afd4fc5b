// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Registry
//!
//! Keeps the exchanges and queues declared through a connection, keyed by name.
//! Declaring a name twice returns the registered entity when the options agree and
//! fails with `IncompatibleOptionsError` when they don't. The registry lock is held
//! across the broker round trip, so concurrent declarations of one name issue a single
//! transport declare.

use crate::{
    channel::Channel,
    errors::AmqpError,
    exchange::{Exchange, ExchangeKind, ExchangeOptions},
    marshaller::Marshaller,
    queue::{Queue, QueueOptions},
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

#[derive(Default)]
pub(crate) struct Topology {
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    exchanges: Mutex<HashMap<String, Arc<Exchange>>>,
}

impl Topology {
    pub(crate) async fn queue(
        &self,
        channel: Arc<Channel>,
        name: &str,
        options: &QueueOptions,
        inherited: Arc<dyn Marshaller>,
    ) -> Result<Arc<Queue>, AmqpError> {
        let mut queues = self.queues.lock().await;

        if let Some(queue) = queues.get(name) {
            if !queue.matches(options) {
                error!(name = name, "queue already declared with other options");
                return Err(AmqpError::IncompatibleOptionsError(format!(
                    "queue {} already declared with durable={} auto_delete={}",
                    name,
                    queue.durable(),
                    queue.auto_delete()
                )));
            }
            debug!("queue: {} already declared", name);
            return Ok(queue.clone());
        }

        let queue = Arc::new(Queue::declare(channel, name, options, inherited).await?);
        queues.insert(name.to_owned(), queue.clone());
        Ok(queue)
    }

    pub(crate) async fn exchange(
        &self,
        channel: Arc<Channel>,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
        inherited: Arc<dyn Marshaller>,
    ) -> Result<Arc<Exchange>, AmqpError> {
        let mut exchanges = self.exchanges.lock().await;

        if let Some(exchange) = exchanges.get(name) {
            if exchange.kind() != kind || !exchange.matches(options) {
                error!(name = name, "exchange already declared with other options");
                return Err(AmqpError::IncompatibleOptionsError(format!(
                    "exchange {} already declared as {:?} with durable={} auto_delete={}",
                    name,
                    exchange.kind(),
                    exchange.durable(),
                    exchange.auto_delete()
                )));
            }
            debug!("exchange: {} already declared", name);
            return Ok(exchange.clone());
        }

        let exchange =
            Arc::new(Exchange::declare(channel, name, kind, options, inherited).await?);
        exchanges.insert(name.to_owned(), exchange.clone());
        Ok(exchange)
    }

    pub(crate) async fn find_queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.lock().await.get(name).cloned()
    }

    pub(crate) async fn find_exchange(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges.lock().await.get(name).cloned()
    }

    /// Deletes the queue on the broker, then forgets it.
    pub(crate) async fn delete_queue(
        &self,
        channel: &Channel,
        name: &str,
    ) -> Result<(), AmqpError> {
        let mut queues = self.queues.lock().await;
        channel.transport().delete_queue(name).await?;
        queues.remove(name);
        Ok(())
    }

    /// Deletes the exchange on the broker, then forgets it.
    pub(crate) async fn delete_exchange(
        &self,
        channel: &Channel,
        name: &str,
    ) -> Result<(), AmqpError> {
        let mut exchanges = self.exchanges.lock().await;
        channel.transport().delete_exchange(name).await?;
        exchanges.remove(name);
        Ok(())
    }

    pub(crate) async fn queues(&self) -> Vec<Arc<Queue>> {
        self.queues.lock().await.values().cloned().collect()
    }

    pub(crate) async fn clear(&self) {
        self.queues.lock().await.clear();
        self.exchanges.lock().await.clear();
    }
}
