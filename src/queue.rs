// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides the queue entity. A [`Queue`] is declared once per name on a
//! connection and offers:
//! - bindings to any number of exchanges, each with its own routing key
//! - publishing through its first binding, creating a private fanout exchange on demand
//! - synchronous retrieval of single messages
//! - the three consumer strategies of the [`dispatcher`](crate::dispatcher) module

use crate::{
    channel::Channel,
    consumer::{DeliveryHandler, ReactiveHandler},
    dispatcher::{self, ConsumerHandle, ConsumerSource, ReactiveOptions},
    errors::AmqpError,
    exchange::{Exchange, ExchangeKind, ExchangeOptions},
    marshaller::{Marshaller, MarshallerCell, MarshallerSelector, Payload},
    publisher::{self, PublishOptions, PublishOutcome, PublishRequest},
    topology::{AMQP_HEADERS_MAX_LENGTH, AMQP_HEADERS_MAX_LENGTH_BYTES, AMQP_HEADERS_MESSAGE_TTL},
    transport::Envelope,
};
use lapin::{
    types::{AMQPValue, FieldTable, LongInt, ShortString},
    BasicProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Declaration options of a queue.
///
/// This struct implements the builder pattern. By default the queue is transient,
/// shared, never auto-deleted and inherits the marshaller of its connection.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) marshaller: Option<MarshallerSelector>,
}

impl QueueOptions {
    pub fn new() -> QueueOptions {
        QueueOptions::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live of the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Overrides the marshaller inherited from the connection.
    pub fn marshaller(mut self, marshaller: MarshallerSelector) -> Self {
        self.marshaller = Some(marshaller);
        self
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        let limits = [
            (AMQP_HEADERS_MESSAGE_TTL, self.ttl),
            (AMQP_HEADERS_MAX_LENGTH, self.max_length),
            (AMQP_HEADERS_MAX_LENGTH_BYTES, self.max_length_bytes),
        ];
        for (key, value) in limits {
            if let Some(value) = value {
                args.insert(
                    ShortString::from(key),
                    AMQPValue::LongInt(LongInt::from(value)),
                );
            }
        }

        FieldTable::from(args)
    }
}

/// Options of `Queue::retrieve`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetrieveOptions {
    pub(crate) no_ack: bool,
}

impl RetrieveOptions {
    pub fn new() -> RetrieveOptions {
        RetrieveOptions::default()
    }

    /// Fetches the message in no-ack mode, the broker forgets it once sent.
    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }
}

/// A message fetched with `Queue::retrieve`.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieved {
    pub body: Payload,
    pub properties: BasicProperties,
    pub envelope: Envelope,
}

/// A binding of a queue to an exchange.
#[derive(Clone)]
pub struct Binding {
    exchange: Arc<Exchange>,
    routing_key: String,
}

impl Binding {
    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn is(&self, exchange: &str, routing_key: &str) -> bool {
        self.exchange.name() == exchange && self.routing_key == routing_key
    }
}

/// A declared queue.
pub struct Queue {
    name: String,
    durable: bool,
    auto_delete: bool,
    exclusive: bool,
    channel: Arc<Channel>,
    marshaller: Arc<MarshallerCell>,
    bindings: Mutex<Vec<Binding>>,
}

impl Queue {
    /// Validates the options and declares the queue on the broker.
    pub(crate) async fn declare(
        channel: Arc<Channel>,
        name: &str,
        options: &QueueOptions,
        inherited: Arc<dyn Marshaller>,
    ) -> Result<Queue, AmqpError> {
        if name.is_empty() {
            return Err(AmqpError::ConfigurationError(
                "queue name must not be empty".to_owned(),
            ));
        }

        let marshaller = MarshallerCell::resolve(options.marshaller.as_ref(), inherited)?;

        debug!("creating queue: {}", name);
        let name = channel
            .transport()
            .declare_queue(
                name,
                options.durable,
                options.exclusive,
                options.auto_delete,
                options.arguments(),
            )
            .await?;
        debug!("queue: {} was created", name);

        Ok(Queue {
            name,
            durable: options.durable,
            auto_delete: options.auto_delete,
            exclusive: options.exclusive,
            channel,
            marshaller: Arc::new(marshaller),
            bindings: Mutex::new(vec![]),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn marshaller(&self) -> Arc<dyn Marshaller> {
        self.marshaller.get()
    }

    /// Replaces the marshaller used by subsequent publishes, retrievals and deliveries.
    ///
    /// An invalid marshaller is refused and the current one is kept.
    pub fn set_marshaller(&self, marshaller: &MarshallerSelector) -> Result<(), AmqpError> {
        self.marshaller.set(marshaller)
    }

    pub(crate) fn matches(&self, options: &QueueOptions) -> bool {
        self.durable == options.durable && self.auto_delete == options.auto_delete
    }

    /// Current bindings, in the order they were made.
    pub async fn bindings(&self) -> Vec<Binding> {
        self.bindings.lock().await.clone()
    }

    /// Binds the queue to an exchange.
    ///
    /// Both sides must agree on durability. Binding the same pair twice is a no-op.
    pub async fn bind(&self, exchange: &Arc<Exchange>, routing_key: &str) -> Result<(), AmqpError> {
        if exchange.durable() != self.durable {
            return Err(AmqpError::IncompatibleOptionsError(format!(
                "queue {} durable={} cannot bind to exchange {} durable={}",
                self.name,
                self.durable,
                exchange.name(),
                exchange.durable()
            )));
        }

        let mut bindings = self.bindings.lock().await;
        if bindings.iter().any(|b| b.is(exchange.name(), routing_key)) {
            return Ok(());
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            self.name,
            exchange.name(),
            routing_key
        );
        self.channel
            .transport()
            .bind_queue(&self.name, exchange.name(), routing_key)
            .await?;

        bindings.push(Binding {
            exchange: exchange.clone(),
            routing_key: routing_key.to_owned(),
        });
        Ok(())
    }

    /// Removes one binding. Unknown pairs are ignored.
    pub async fn unbind(&self, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        let mut bindings = self.bindings.lock().await;
        let Some(position) = bindings.iter().position(|b| b.is(exchange, routing_key)) else {
            return Ok(());
        };

        self.channel
            .transport()
            .unbind_queue(&self.name, exchange, routing_key)
            .await?;
        bindings.remove(position);
        Ok(())
    }

    /// Removes every binding of the queue.
    pub async fn unbind_all(&self) -> Result<(), AmqpError> {
        let mut bindings = self.bindings.lock().await;

        while let Some(binding) = bindings.first() {
            self.channel
                .transport()
                .unbind_queue(&self.name, binding.exchange.name(), &binding.routing_key)
                .await?;
            bindings.remove(0);
        }

        Ok(())
    }

    /// Returns the first binding, binding to `<queue>_exchange` when there is none.
    ///
    /// The exchange is a fanout exchange sharing the queue's durability and marshaller.
    /// It is not registered on the connection.
    async fn auto_bind(&self) -> Result<Binding, AmqpError> {
        let mut bindings = self.bindings.lock().await;
        if let Some(binding) = bindings.first() {
            return Ok(binding.clone());
        }

        let mut options = ExchangeOptions::new();
        if self.durable {
            options = options.durable();
        }

        let exchange = Exchange::declare(
            self.channel.clone(),
            &format!("{}_exchange", self.name),
            ExchangeKind::Fanout,
            &options,
            self.marshaller.get(),
        )
        .await?;

        self.channel
            .transport()
            .bind_queue(&self.name, exchange.name(), "")
            .await?;

        let binding = Binding {
            exchange: Arc::new(exchange),
            routing_key: String::new(),
        };
        bindings.push(binding.clone());
        Ok(binding)
    }

    /// Publishes through the first binding, using the queue's marshaller.
    pub async fn publish(
        &self,
        body: impl Into<Payload>,
        options: PublishOptions,
    ) -> Result<PublishOutcome, AmqpError> {
        self.send(body.into(), options, false).await
    }

    /// Publishes a message the broker must persist.
    ///
    /// Fails with `PersistenceMismatchError` when the queue is not durable.
    pub async fn persistent_publish(
        &self,
        body: impl Into<Payload>,
        options: PublishOptions,
    ) -> Result<PublishOutcome, AmqpError> {
        if !self.durable {
            return Err(AmqpError::PersistenceMismatchError(format!(
                "queue {}",
                self.name
            )));
        }

        self.send(body.into(), options, true).await
    }

    async fn send(
        &self,
        body: Payload,
        options: PublishOptions,
        persistent: bool,
    ) -> Result<PublishOutcome, AmqpError> {
        let binding = self.auto_bind().await?;
        let marshaller = self.marshaller.get();

        publisher::publish(
            &self.channel,
            marshaller.as_ref(),
            PublishRequest {
                exchange: binding.exchange.name(),
                routing_key: &binding.routing_key,
                persistent,
            },
            body,
            &options,
        )
        .await
    }

    /// Fetches a single message, if any is ready.
    ///
    /// Unless `no_ack` is set the message is acknowledged once decoded.
    pub async fn retrieve(&self, options: RetrieveOptions) -> Result<Option<Retrieved>, AmqpError> {
        self.auto_bind().await?;

        let transport = self.channel.transport();
        let Some(delivery) = transport.get(&self.name, options.no_ack).await? else {
            return Ok(None);
        };

        let body = self.marshaller.get().decode(&delivery.body).map_err(|err| {
            error!(error = err.to_string(), queue = self.name, "error to decode message");
            err
        })?;

        if !options.no_ack {
            transport.ack(delivery.envelope.delivery_tag, false).await?;
        }

        Ok(Some(Retrieved {
            body,
            properties: delivery.properties,
            envelope: delivery.envelope,
        }))
    }

    /// Removes every ready message, returning how many were dropped.
    pub async fn purge(&self) -> Result<u32, AmqpError> {
        self.channel.transport().purge(&self.name).await
    }

    fn source(&self) -> ConsumerSource {
        ConsumerSource {
            queue: self.name.clone(),
            transport: self.channel.transport().clone(),
            marshaller: self.marshaller.clone(),
        }
    }

    /// Registers a standing consumer drained on a background task.
    ///
    /// Every delivery is acknowledged once `handler` returned successfully.
    pub async fn subscribe(&self, handler: DeliveryHandler) -> Result<ConsumerHandle, AmqpError> {
        self.auto_bind().await?;
        dispatcher::subscribe(self.source(), handler).await
    }

    /// Drains the queue on the calling task until the consumer stops or fails.
    pub async fn loop_subscribe(&self, handler: DeliveryHandler) -> Result<(), AmqpError> {
        self.auto_bind().await?;
        dispatcher::loop_subscribe(&self.source(), &handler).await
    }

    /// Like `loop_subscribe`, with the handler in charge of acknowledging.
    pub async fn reactive_loop_subscribe(
        &self,
        handler: ReactiveHandler,
        options: ReactiveOptions,
    ) -> Result<(), AmqpError> {
        self.auto_bind().await?;
        dispatcher::reactive_loop_subscribe(&self.source(), &handler, options).await
    }
}
