// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! Production implementation of the [`Transport`] facade on top of a lapin connection
//! and a single lapin channel. Every lapin failure is logged and mapped to the
//! matching [`AmqpError`]. Broker returns and publisher confirms are surfaced through
//! the listeners registered on the session.
//!
//! lapin only hands returned messages over through publisher confirms, so the first
//! mandatory publish puts the session in confirm mode. Confirms are reported to the
//! confirm listener only once the application enabled them with `confirm_select`.

use crate::{
    config::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeKind,
    transport::{
        BrokerConfirm, ConfirmListener, Delivery, DeliveryStream, Envelope, ReturnListener,
        ReturnedMessage, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::BasicReturnMessage,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicPublishOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
        QueuePurgeOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use parking_lot::Mutex;
use std::{io::ErrorKind, sync::Arc};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            envelope: Envelope {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
            },
            properties: delivery.properties,
            body: delivery.data,
        }
    }
}

impl From<BasicReturnMessage> for ReturnedMessage {
    fn from(returned: BasicReturnMessage) -> Self {
        ReturnedMessage {
            reply_code: returned.reply_code,
            reply_text: returned.reply_text.to_string(),
            exchange: returned.delivery.exchange.to_string(),
            routing_key: returned.delivery.routing_key.to_string(),
            properties: returned.delivery.properties,
            body: returned.delivery.data,
        }
    }
}

#[derive(Default)]
struct Listeners {
    returns: Mutex<Option<ReturnListener>>,
    confirms: Mutex<Option<ConfirmListener>>,
}

impl Listeners {
    fn notify_return(&self, returned: BasicReturnMessage) {
        let listener = self.returns.lock().clone();
        if let Some(listener) = listener {
            listener(returned.into());
        }
    }

    fn notify_confirm(&self, confirm: BrokerConfirm) {
        let listener = self.confirms.lock().clone();
        if let Some(listener) = listener {
            listener(confirm);
        }
    }
}

/// Publisher confirm bookkeeping of the session.
///
/// The broker numbers confirms from 1, starting at `confirm.select`. Publishes made
/// before that are not counted.
#[derive(Debug, Default)]
struct ConfirmSequence {
    selected: bool,
    reported: bool,
    published: u64,
}

impl ConfirmSequence {
    fn needs_select(&self) -> bool {
        !self.selected
    }

    /// Records a successful `confirm.select`; `reported` exposes confirms to listeners.
    fn selected(&mut self, reported: bool) {
        if !self.selected {
            self.selected = true;
            self.published = 0;
        }
        self.reported |= reported;
    }

    /// Delivery tag the broker assigns to the next publish, if confirms are on.
    fn next_tag(&mut self) -> Option<u64> {
        if !self.selected {
            return None;
        }
        self.published += 1;
        Some(self.published)
    }
}

/// A broker session backed by lapin.
pub struct LapinTransport {
    connection: Connection,
    channel: Channel,
    listeners: Arc<Listeners>,
    confirms: tokio::sync::Mutex<ConfirmSequence>,
}

impl LapinTransport {
    /// Connects to the broker described by `cfg` and opens the session channel.
    pub async fn connect(cfg: &RabbitMQConfigs) -> Result<LapinTransport, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        let uri = cfg.uri()?;
        let connecting = Connection::connect(&uri, options);

        let connected = match cfg.connect_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result,
                Err(_) => {
                    error!(host = %cfg.host, "connection timed out");
                    return Err(AmqpError::ConnectionError("connection timed out".to_owned()));
                }
            },
            None => connecting.await,
        };

        let connection = connected.map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            AmqpError::ConnectionError(err.to_string())
        })?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        let channel = connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ConnectionError(err.to_string())
        })?;
        debug!("channel created");

        Ok(LapinTransport {
            connection,
            channel,
            listeners: Arc::new(Listeners::default()),
            confirms: tokio::sync::Mutex::new(ConfirmSequence::default()),
        })
    }

    async fn select_confirms(&self, reported: bool) -> Result<(), AmqpError> {
        let mut confirms = self.confirms.lock().await;

        if confirms.needs_select() {
            debug!("putting channel in confirm mode");
            self.channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error enabling publisher confirms");
                    AmqpError::ConnectionError(err.to_string())
                })?;
        }

        confirms.selected(reported);
        Ok(())
    }
}

fn consume_error(err: lapin::Error) -> AmqpError {
    match &err {
        lapin::Error::IOError(io) if io.kind() == ErrorKind::Interrupted => AmqpError::Interrupted,
        _ => AmqpError::ConsumerError(err.to_string()),
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        args: FieldTable,
    ) -> Result<String, AmqpError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable,
                    exclusive,
                    auto_delete,
                    nowait: false,
                },
                args,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = name, "error to declare the queue");
                AmqpError::DeclareQueueError(name.to_owned())
            })?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable,
                    auto_delete,
                    internal: false,
                    nowait: false,
                },
                args,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to unbind queue from exchange");
                AmqpError::UnbindingError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<(), AmqpError> {
        if mandatory {
            self.select_confirms(false).await?;
        }

        // held across the publish so tags follow the broker's numbering
        let mut confirms = self.confirms.lock().await;
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate,
                },
                &body,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        let delivery_tag = confirms.next_tag();
        let reported = confirms.reported;
        drop(confirms);

        let listeners = self.listeners.clone();
        tokio::spawn(async move {
            match confirm.await {
                Ok(Confirmation::Ack(returned)) => {
                    if let Some(returned) = returned {
                        listeners.notify_return(*returned);
                    }
                    if let (true, Some(delivery_tag)) = (reported, delivery_tag) {
                        listeners.notify_confirm(BrokerConfirm::Ack {
                            delivery_tag,
                            multiple: false,
                        });
                    }
                }
                Ok(Confirmation::Nack(returned)) => {
                    if let Some(returned) = returned {
                        listeners.notify_return(*returned);
                    }
                    if let (true, Some(delivery_tag)) = (reported, delivery_tag) {
                        listeners.notify_confirm(BrokerConfirm::Nack {
                            delivery_tag,
                            multiple: false,
                        });
                    }
                }
                Ok(Confirmation::NotRequested) => {}
                Err(err) => error!(error = err.to_string(), "error waiting publisher confirm"),
            }
        });

        Ok(())
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>, AmqpError> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = queue, "error getting message");
                AmqpError::GetMessageError(queue.to_owned())
            })?;

        Ok(message.map(|message| message.delivery.into()))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| result.map(Delivery::from).map_err(consume_error))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error cancelling consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError(err.to_string())
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError(err.to_string())
            })
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.select_confirms(true).await
    }

    fn register_return_listener(&self, listener: Option<ReturnListener>) {
        *self.listeners.returns.lock() = listener;
    }

    fn register_confirm_listener(&self, listener: Option<ConfirmListener>) {
        *self.listeners.confirms.lock() = listener;
    }

    async fn purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = queue, "error purging queue");
                AmqpError::PurgeQueueError(queue.to_owned())
            })
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name = name, "error deleting queue");
                AmqpError::DeleteQueueError(name.to_owned())
            })
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = name, "error deleting exchange");
                AmqpError::DeleteExchangeError(name.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error closing the channel");
                AmqpError::CloseError(err.to_string())
            })?;

        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error closing the connection");
                AmqpError::CloseError(err.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_before_select_are_not_numbered() {
        let mut confirms = ConfirmSequence::default();
        assert_eq!(confirms.next_tag(), None);
        assert_eq!(confirms.next_tag(), None);

        assert!(confirms.needs_select());
        confirms.selected(true);

        assert_eq!(confirms.next_tag(), Some(1));
        assert_eq!(confirms.next_tag(), Some(2));
    }

    #[test]
    fn implicit_select_for_returns_keeps_confirms_unreported() {
        let mut confirms = ConfirmSequence::default();
        confirms.selected(false);
        assert!(!confirms.reported);
        assert_eq!(confirms.next_tag(), Some(1));

        // enabling confirms later keeps the broker's numbering
        assert!(!confirms.needs_select());
        confirms.selected(true);
        assert!(confirms.reported);
        assert_eq!(confirms.next_tag(), Some(2));
    }
}
