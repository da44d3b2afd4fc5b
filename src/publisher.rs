// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publishing
//!
//! Plain publishing is fire-and-forget: the body is marshalled, handed to the transport
//! and given back to the caller. A publish can also ask to wait for the broker's
//! reaction (a returned message, a confirm ack/nack) within a timeout. The wait uses
//! a single-slot hand-off fed by listeners installed on the channel for the duration
//! of the call.
//!
//! Returns and confirms are correlated per channel, not per message. Feedback-awaiting
//! publishes on one channel are therefore serialized, so each of them observes the
//! first notification arriving after its own publish.

use crate::{
    channel::Channel,
    errors::AmqpError,
    marshaller::{Marshaller, Payload},
    otel,
    transport::{BrokerConfirm, ConfirmListener, ReturnListener, ReturnedMessage},
};
use lapin::{types::ShortString, BasicProperties};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

/// Content type of the default message properties
pub const TEXT_PLAIN_CONTENT_TYPE: &str = "text/plain";

const TRANSIENT_DELIVERY_MODE: u8 = 1;
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Default properties of a published message: text content, transient delivery.
pub fn text_plain() -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(TEXT_PLAIN_CONTENT_TYPE))
        .with_delivery_mode(TRANSIENT_DELIVERY_MODE)
        .with_priority(0)
}

/// Default properties of a persistent message: text content, persistent delivery.
pub fn persistent_text_plain() -> BasicProperties {
    text_plain().with_delivery_mode(PERSISTENT_DELIVERY_MODE)
}

/// The broker reaction observed by a feedback-awaiting publish.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishFeedback {
    /// The broker could not route the message and sent it back
    Return(ReturnedMessage),
    Ack { delivery_tag: u64, multiple: bool },
    Nack { delivery_tag: u64, multiple: bool },
    /// Nothing arrived before the timeout elapsed
    TimeOut,
}

impl From<BrokerConfirm> for PublishFeedback {
    fn from(confirm: BrokerConfirm) -> Self {
        match confirm {
            BrokerConfirm::Ack {
                delivery_tag,
                multiple,
            } => PublishFeedback::Ack {
                delivery_tag,
                multiple,
            },
            BrokerConfirm::Nack {
                delivery_tag,
                multiple,
            } => PublishFeedback::Nack {
                delivery_tag,
                multiple,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FeedbackOptions {
    pub(crate) returns: bool,
    pub(crate) confirms: bool,
    pub(crate) timeout: Option<Duration>,
}

/// Options of a single publish.
///
/// This struct implements the builder pattern; every option defaults to off.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub(crate) properties: Option<BasicProperties>,
    pub(crate) mandatory: bool,
    pub(crate) immediate: bool,
    pub(crate) feedback: Option<FeedbackOptions>,
}

impl PublishOptions {
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    /// Replaces the default text/plain properties.
    pub fn properties(mut self, properties: BasicProperties) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Asks the broker to return the message if it cannot be routed to any queue.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Waits for a returned message before giving control back.
    pub fn listen_for_returns(mut self) -> Self {
        self.feedback.get_or_insert_with(FeedbackOptions::default).returns = true;
        self
    }

    /// Waits for a publisher confirm before giving control back.
    ///
    /// The channel must be in confirm mode, see `Connection::enable_confirms`.
    pub fn listen_for_confirms(mut self) -> Self {
        self.feedback.get_or_insert_with(FeedbackOptions::default).confirms = true;
        self
    }

    /// Overrides how long a feedback-awaiting publish waits.
    pub fn feedback_timeout(mut self, timeout: Duration) -> Self {
        self.feedback.get_or_insert_with(FeedbackOptions::default).timeout = Some(timeout);
        self
    }
}

/// Result of a publish accepted into the local pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOutcome {
    /// The body as given by the caller, before marshalling
    pub body: Payload,
    /// The broker reaction, present only when the publish listened for one
    pub feedback: Option<PublishFeedback>,
}

/// Reinstalls the application callbacks when dropped, also when the wait is cancelled.
struct RestoreListeners<'c>(&'c Channel);

impl Drop for RestoreListeners<'_> {
    fn drop(&mut self) {
        self.0.restore_listeners();
    }
}

pub(crate) struct PublishRequest<'p> {
    pub(crate) exchange: &'p str,
    pub(crate) routing_key: &'p str,
    pub(crate) persistent: bool,
}

/// Marshals and publishes a body, waiting for broker feedback when requested.
pub(crate) async fn publish(
    channel: &Channel,
    marshaller: &dyn Marshaller,
    request: PublishRequest<'_>,
    body: Payload,
    options: &PublishOptions,
) -> Result<PublishOutcome, AmqpError> {
    let bytes = marshaller.encode(&body)?;

    let mut properties = match (&options.properties, request.persistent) {
        (Some(properties), false) => properties.clone(),
        (Some(properties), true) => properties.clone().with_delivery_mode(PERSISTENT_DELIVERY_MODE),
        (None, false) => text_plain(),
        (None, true) => persistent_text_plain(),
    };
    if properties.message_id().is_none() {
        properties = properties.with_message_id(ShortString::from(Uuid::new_v4().to_string()));
    }
    let properties = otel::inject_context(properties);

    debug!(
        exchange = request.exchange,
        routing_key = request.routing_key,
        "publishing message"
    );

    let feedback = match &options.feedback {
        None => {
            channel
                .transport()
                .publish(
                    request.exchange,
                    request.routing_key,
                    options.mandatory,
                    options.immediate,
                    properties,
                    bytes,
                )
                .await?;
            None
        }
        Some(feedback) => Some(
            publish_with_feedback(channel, &request, options, feedback, properties, bytes).await?,
        ),
    };

    Ok(PublishOutcome { body, feedback })
}

async fn publish_with_feedback(
    channel: &Channel,
    request: &PublishRequest<'_>,
    options: &PublishOptions,
    feedback: &FeedbackOptions,
    properties: BasicProperties,
    bytes: Vec<u8>,
) -> Result<PublishFeedback, AmqpError> {
    let _serialized = channel.feedback_lock.lock().await;
    let transport = channel.transport();

    let (sender, mut receiver) = mpsc::channel::<PublishFeedback>(1);
    let _restore = RestoreListeners(channel);

    if feedback.returns {
        let sender = sender.clone();
        let listener: ReturnListener = Arc::new(move |returned| {
            let _ = sender.try_send(PublishFeedback::Return(returned));
        });
        transport.register_return_listener(Some(listener));
    }

    if feedback.confirms {
        let sender = sender.clone();
        let listener: ConfirmListener = Arc::new(move |confirm| {
            let _ = sender.try_send(confirm.into());
        });
        transport.register_confirm_listener(Some(listener));
    }

    let published = transport
        .publish(
            request.exchange,
            request.routing_key,
            options.mandatory,
            options.immediate,
            properties,
            bytes,
        )
        .await;

    if let Err(err) = published {
        error!(error = err.to_string(), "error publishing message with feedback");
        return Err(err);
    }

    let timeout = feedback.timeout.unwrap_or(channel.feedback_timeout);
    match tokio::time::timeout(timeout, receiver.recv()).await {
        Ok(Some(feedback)) => Ok(feedback),
        Ok(None) | Err(_) => Ok(PublishFeedback::TimeOut),
    }
}
