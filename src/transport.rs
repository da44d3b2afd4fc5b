// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Facade
//!
//! The narrow set of broker primitives the client is built on. Everything above this
//! trait (entities, dispatch, publish feedback, RPC) only talks to the broker through
//! it, which keeps the wire protocol, framing and socket handling out of the core.
//!
//! [`crate::lapin_transport::LapinTransport`] is the production implementation.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{types::FieldTable, BasicProperties};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Routing metadata of a single delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Opaque handle used to acknowledge or reject exactly this delivery
    pub delivery_tag: u64,
    /// Whether the broker already delivered this message before
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// A message as handed over by the transport, before decoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub properties: BasicProperties,
    pub envelope: Envelope,
}

/// A message the broker could not route and sent back to the publisher.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

/// A publisher confirm sent by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerConfirm {
    Ack { delivery_tag: u64, multiple: bool },
    Nack { delivery_tag: u64, multiple: bool },
}

/// Callback receiving returned messages of a channel.
pub type ReturnListener = Arc<dyn Fn(ReturnedMessage) + Send + Sync>;

/// Callback receiving publisher confirms of a channel.
pub type ConfirmListener = Arc<dyn Fn(BrokerConfirm) + Send + Sync>;

/// Deliveries of a standing consumer. The stream ends once the consumer is cancelled.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Primitive operations of an already connected, already authenticated broker session.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares a queue and returns its effective name.
    ///
    /// An empty `name` asks the broker to generate one.
    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        args: FieldTable,
    ) -> Result<String, AmqpError>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<(), AmqpError>;

    /// Fetches a single message, returning `None` when the queue is empty.
    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>, AmqpError>;

    /// Registers a standing consumer on the queue.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Puts the session in publisher confirm mode.
    ///
    /// Confirms are numbered from 1 starting at this call.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Replaces the return listener of the session; `None` removes it.
    ///
    /// Unroutable mandatory publishes must reach the listener whether or not the
    /// application put the session in confirm mode.
    fn register_return_listener(&self, listener: Option<ReturnListener>);

    /// Replaces the confirm listener of the session; `None` removes it.
    fn register_confirm_listener(&self, listener: Option<ConfirmListener>);

    /// Drops every ready message of the queue and returns how many were removed.
    async fn purge(&self, queue: &str) -> Result<u32, AmqpError>;

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
