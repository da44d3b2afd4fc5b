// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides the exchange entity. Exchanges are the routing mechanism in
//! RabbitMQ that determine how messages are distributed to queues. An [`Exchange`] is
//! declared once per name on a connection, owns a marshaller and is the main entry
//! point for publishing.

use crate::{
    channel::Channel,
    errors::AmqpError,
    marshaller::{Marshaller, MarshallerCell, MarshallerSelector, Payload},
    publisher::{self, PublishOptions, PublishOutcome, PublishRequest},
};
use lapin::types::FieldTable;
use std::sync::Arc;
use tracing::debug;

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Declaration options of an exchange.
///
/// This struct implements the builder pattern. By default the exchange is transient,
/// is not auto-deleted and inherits the marshaller of its connection.
#[derive(Debug, Clone, Default)]
pub struct ExchangeOptions {
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) marshaller: Option<MarshallerSelector>,
}

impl ExchangeOptions {
    pub fn new() -> ExchangeOptions {
        ExchangeOptions::default()
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Overrides the marshaller inherited from the connection.
    pub fn marshaller(mut self, marshaller: MarshallerSelector) -> Self {
        self.marshaller = Some(marshaller);
        self
    }
}

/// A declared exchange.
pub struct Exchange {
    name: String,
    kind: ExchangeKind,
    durable: bool,
    auto_delete: bool,
    channel: Arc<Channel>,
    marshaller: MarshallerCell,
}

impl Exchange {
    /// Validates the options and declares the exchange on the broker.
    pub(crate) async fn declare(
        channel: Arc<Channel>,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
        inherited: Arc<dyn Marshaller>,
    ) -> Result<Exchange, AmqpError> {
        if name.is_empty() {
            return Err(AmqpError::ConfigurationError(
                "exchange name must not be empty".to_owned(),
            ));
        }

        let marshaller = MarshallerCell::resolve(options.marshaller.as_ref(), inherited)?;

        debug!("creating exchange: {}", name);
        channel
            .transport()
            .declare_exchange(
                name,
                kind,
                options.durable,
                options.auto_delete,
                FieldTable::default(),
            )
            .await?;
        debug!("exchange: {} was created", name);

        Ok(Exchange {
            name: name.to_owned(),
            kind,
            durable: options.durable,
            auto_delete: options.auto_delete,
            channel,
            marshaller,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn marshaller(&self) -> Arc<dyn Marshaller> {
        self.marshaller.get()
    }

    /// Replaces the marshaller used by subsequent publishes.
    ///
    /// An invalid marshaller is refused and the current one is kept.
    pub fn set_marshaller(&self, marshaller: &MarshallerSelector) -> Result<(), AmqpError> {
        self.marshaller.set(marshaller)
    }

    pub(crate) fn matches(&self, options: &ExchangeOptions) -> bool {
        self.durable == options.durable && self.auto_delete == options.auto_delete
    }

    /// Publishes a message through this exchange.
    pub async fn publish(
        &self,
        body: impl Into<Payload>,
        routing_key: &str,
        options: PublishOptions,
    ) -> Result<PublishOutcome, AmqpError> {
        self.send(body.into(), routing_key, options, false).await
    }

    /// Publishes a message the broker must persist.
    ///
    /// Fails with `PersistenceMismatchError` when the exchange is not durable.
    pub async fn persistent_publish(
        &self,
        body: impl Into<Payload>,
        routing_key: &str,
        options: PublishOptions,
    ) -> Result<PublishOutcome, AmqpError> {
        if !self.durable {
            return Err(AmqpError::PersistenceMismatchError(format!(
                "exchange {}",
                self.name
            )));
        }

        self.send(body.into(), routing_key, options, true).await
    }

    async fn send(
        &self,
        body: Payload,
        routing_key: &str,
        options: PublishOptions,
        persistent: bool,
    ) -> Result<PublishOutcome, AmqpError> {
        let marshaller = self.marshaller.get();

        publisher::publish(
            &self.channel,
            marshaller.as_ref(),
            PublishRequest {
                exchange: &self.name,
                routing_key,
                persistent,
            },
            body,
            &options,
        )
        .await
    }
}
