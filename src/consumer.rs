// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! This module holds the per-delivery contract shared by every consumer strategy:
//! decode the body with the queue's marshaller, invoke the application handler,
//! then acknowledge according to the strategy. Handlers choose how much of the
//! delivery they receive through the [`DeliveryHandler`] constructors, and reactive
//! handlers receive a [`ReactiveMessage`] they may ack or reject themselves.

use crate::{
    errors::AmqpError,
    marshaller::{Marshaller, Payload},
    otel,
    transport::{Delivery, Envelope, Transport},
};
use futures_util::future::BoxFuture;
use lapin::BasicProperties;
use opentelemetry::trace::{Span, Status};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error};

/// Error returned by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by application handlers.
pub type HandlerResult = Result<(), HandlerError>;

type BodyFn = dyn Fn(Payload) -> BoxFuture<'static, HandlerResult> + Send + Sync;
type BodyAndPropertiesFn =
    dyn Fn(Payload, BasicProperties) -> BoxFuture<'static, HandlerResult> + Send + Sync;
type FullDeliveryFn =
    dyn Fn(Payload, BasicProperties, Envelope) -> BoxFuture<'static, HandlerResult> + Send + Sync;
type ReactiveFn = dyn Fn(ReactiveMessage) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// Application callback invoked for each delivery of `subscribe` and `loop_subscribe`.
#[derive(Clone)]
pub enum DeliveryHandler {
    Body(Arc<BodyFn>),
    BodyAndProperties(Arc<BodyAndPropertiesFn>),
    BodyPropertiesAndEnvelope(Arc<FullDeliveryFn>),
}

impl DeliveryHandler {
    /// A handler receiving only the decoded body.
    pub fn on_body<F, Fut>(handler: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        DeliveryHandler::Body(Arc::new(move |body| Box::pin(handler(body))))
    }

    /// A handler receiving the decoded body and the message properties.
    pub fn on_body_and_properties<F, Fut>(handler: F) -> Self
    where
        F: Fn(Payload, BasicProperties) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        DeliveryHandler::BodyAndProperties(Arc::new(move |body, properties| {
            Box::pin(handler(body, properties))
        }))
    }

    /// A handler receiving the decoded body, the message properties and the envelope.
    pub fn on_body_properties_and_envelope<F, Fut>(handler: F) -> Self
    where
        F: Fn(Payload, BasicProperties, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        DeliveryHandler::BodyPropertiesAndEnvelope(Arc::new(move |body, properties, envelope| {
            Box::pin(handler(body, properties, envelope))
        }))
    }

    async fn call(&self, body: Payload, delivery: &Delivery) -> HandlerResult {
        match self {
            DeliveryHandler::Body(handler) => handler(body).await,
            DeliveryHandler::BodyAndProperties(handler) => {
                handler(body, delivery.properties.clone()).await
            }
            DeliveryHandler::BodyPropertiesAndEnvelope(handler) => {
                handler(body, delivery.properties.clone(), delivery.envelope.clone()).await
            }
        }
    }
}

/// Application callback of `reactive_loop_subscribe`.
#[derive(Clone)]
pub struct ReactiveHandler(Arc<ReactiveFn>);

impl ReactiveHandler {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(ReactiveMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        ReactiveHandler(Arc::new(move |message| Box::pin(handler(message))))
    }
}

/// A decoded delivery handed to a reactive handler, which decides how to acknowledge it.
///
/// Only the first of `ack` / `reject` reaches the broker. Once either was called the
/// consumer loop does not acknowledge the delivery itself.
pub struct ReactiveMessage {
    body: Payload,
    properties: BasicProperties,
    envelope: Envelope,
    transport: Arc<dyn Transport>,
    reacted: Arc<AtomicBool>,
}

impl ReactiveMessage {
    pub fn body(&self) -> &Payload {
        &self.body
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn redelivered(&self) -> bool {
        self.envelope.redelivered
    }

    /// Acknowledges the delivery.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        if self.reacted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.transport.ack(self.envelope.delivery_tag, false).await
    }

    /// Rejects the delivery, asking the broker to requeue it when `requeue` is set.
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.reacted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.transport.reject(self.envelope.delivery_tag, requeue).await
    }

    pub fn acknowledged(&self) -> bool {
        self.reacted.load(Ordering::SeqCst)
    }

    pub fn should_acknowledge(&self) -> bool {
        !self.acknowledged()
    }
}

pub(crate) fn handler_failure(err: HandlerError) -> AmqpError {
    AmqpError::HandlerError(err.to_string())
}

/// Decodes a delivery, runs the handler and acknowledges it once the handler returned.
///
/// A decode or handler failure is returned as is: the delivery stays unacknowledged.
pub(crate) async fn consume(
    queue: &str,
    transport: &Arc<dyn Transport>,
    marshaller: &dyn Marshaller,
    delivery: Delivery,
    handler: &DeliveryHandler,
) -> Result<(), AmqpError> {
    let mut span = otel::consumer_span(&delivery.properties, queue);
    debug!(
        "received: {} - exchange: {}",
        delivery.envelope.delivery_tag, delivery.envelope.exchange,
    );

    let result = async {
        let body = marshaller.decode(&delivery.body)?;
        handler.call(body, &delivery).await.map_err(handler_failure)?;
        transport.ack(delivery.envelope.delivery_tag, false).await
    }
    .await;

    finish_span(&mut span, &result);
    result
}

/// Decodes a delivery and hands it to a reactive handler.
///
/// Unless `auto_ack` is set the delivery is acknowledged afterwards, but only if the
/// handler neither acked nor rejected it.
pub(crate) async fn consume_reactive(
    queue: &str,
    transport: &Arc<dyn Transport>,
    marshaller: &dyn Marshaller,
    delivery: Delivery,
    handler: &ReactiveHandler,
    auto_ack: bool,
) -> Result<(), AmqpError> {
    let mut span = otel::consumer_span(&delivery.properties, queue);
    let delivery_tag = delivery.envelope.delivery_tag;

    let result = async {
        let reacted = Arc::new(AtomicBool::new(false));
        let message = ReactiveMessage {
            body: marshaller.decode(&delivery.body)?,
            properties: delivery.properties,
            envelope: delivery.envelope,
            transport: transport.clone(),
            reacted: reacted.clone(),
        };

        (handler.0)(message).await.map_err(handler_failure)?;

        if !auto_ack && !reacted.load(Ordering::SeqCst) {
            transport.ack(delivery_tag, false).await?;
        }
        Ok::<(), AmqpError>(())
    }
    .await;

    finish_span(&mut span, &result);
    result
}

pub(crate) fn finish_span(
    span: &mut opentelemetry::global::BoxedSpan,
    result: &Result<(), AmqpError>,
) {
    match result {
        Ok(()) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
        }
        Err(err) => {
            error!(error = err.to_string(), "error consume msg");
            otel::record_failure(span, err);
        }
    }
}
