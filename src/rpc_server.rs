// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Server
//!
//! An [`RpcServer`] consumes requests from its own queue, hands each decoded body to an
//! [`RpcHandler`] and publishes the handler's value to the request's `reply_to` queue
//! through the default exchange. Requests lacking `reply_to` or `correlation_id` are
//! handled as casts: the handler runs, nothing is sent back.
//!
//! The reply carries the request's content type, content encoding, delivery mode,
//! priority, correlation id and reply-to. Handlers receiving the reply properties may
//! use them as a template.

use crate::{
    channel::Channel,
    consumer::{finish_span, handler_failure, HandlerError},
    dispatcher::next_delivery,
    errors::AmqpError,
    exchange::ExchangeKind,
    marshaller::{Marshaller, MarshallerCell, MarshallerSelector, Payload},
    otel,
    transport::{Delivery, DeliveryStream, Transport},
};
use futures_util::future::BoxFuture;
use lapin::{types::FieldTable, BasicProperties};
use parking_lot::Mutex;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Result returned by RPC handlers: the reply body.
pub type RpcResult = Result<Payload, HandlerError>;

type BodyFn = dyn Fn(Payload) -> BoxFuture<'static, RpcResult> + Send + Sync;
type BodyAndReplyFn =
    dyn Fn(Payload, BasicProperties) -> BoxFuture<'static, RpcResult> + Send + Sync;
type FullRequestFn = dyn Fn(
        Payload,
        BasicProperties,
        BasicProperties,
    ) -> BoxFuture<'static, RpcResult>
    + Send
    + Sync;

/// Application callback answering RPC requests.
#[derive(Clone)]
pub enum RpcHandler {
    Body(Arc<BodyFn>),
    BodyAndReplyProperties(Arc<BodyAndReplyFn>),
    BodyReplyAndRequestProperties(Arc<FullRequestFn>),
}

impl RpcHandler {
    /// A handler receiving only the decoded request body.
    pub fn on_body<F, Fut>(handler: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult> + Send + 'static,
    {
        RpcHandler::Body(Arc::new(move |body| Box::pin(handler(body))))
    }

    /// A handler receiving the request body and the reply properties.
    pub fn on_body_and_reply_properties<F, Fut>(handler: F) -> Self
    where
        F: Fn(Payload, BasicProperties) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult> + Send + 'static,
    {
        RpcHandler::BodyAndReplyProperties(Arc::new(move |body, reply| {
            Box::pin(handler(body, reply))
        }))
    }

    /// A handler receiving the request body, the reply properties and the request properties.
    pub fn on_body_reply_and_request_properties<F, Fut>(handler: F) -> Self
    where
        F: Fn(Payload, BasicProperties, BasicProperties) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult> + Send + 'static,
    {
        RpcHandler::BodyReplyAndRequestProperties(Arc::new(move |body, reply, request| {
            Box::pin(handler(body, reply, request))
        }))
    }

    async fn call(
        &self,
        body: Payload,
        reply: &BasicProperties,
        request: &BasicProperties,
    ) -> RpcResult {
        match self {
            RpcHandler::Body(handler) => handler(body).await,
            RpcHandler::BodyAndReplyProperties(handler) => handler(body, reply.clone()).await,
            RpcHandler::BodyReplyAndRequestProperties(handler) => {
                handler(body, reply.clone(), request.clone()).await
            }
        }
    }
}

/// Options of an RPC server.
///
/// By default the server binds to a direct exchange named after its queue, with an
/// empty routing key, and inherits the marshaller of its connection.
#[derive(Debug, Clone, Default)]
pub struct RpcServerOptions {
    pub(crate) exchange: Option<String>,
    pub(crate) routing_key: String,
    pub(crate) marshaller: Option<MarshallerSelector>,
}

impl RpcServerOptions {
    pub fn new() -> RpcServerOptions {
        RpcServerOptions::default()
    }

    /// Binds the server queue to an existing exchange instead of its own.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self
    }

    pub fn routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = routing_key.to_owned();
        self
    }

    pub fn marshaller(mut self, marshaller: MarshallerSelector) -> Self {
        self.marshaller = Some(marshaller);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcServerState {
    Idle,
    Running,
    Stopped,
}

/// Copies the request properties a reply must carry.
fn reply_properties(request: &BasicProperties) -> BasicProperties {
    let mut reply = BasicProperties::default();

    if let Some(content_type) = request.content_type() {
        reply = reply.with_content_type(content_type.clone());
    }
    if let Some(content_encoding) = request.content_encoding() {
        reply = reply.with_content_encoding(content_encoding.clone());
    }
    if let Some(delivery_mode) = request.delivery_mode() {
        reply = reply.with_delivery_mode(*delivery_mode);
    }
    if let Some(priority) = request.priority() {
        reply = reply.with_priority(*priority);
    }
    if let Some(correlation_id) = request.correlation_id() {
        reply = reply.with_correlation_id(correlation_id.clone());
    }
    if let Some(reply_to) = request.reply_to() {
        reply = reply.with_reply_to(reply_to.clone());
    }

    reply
}

struct Responder {
    queue: String,
    transport: Arc<dyn Transport>,
    marshaller: Arc<MarshallerCell>,
    handler: RpcHandler,
}

impl Responder {
    async fn serve(&self, mut deliveries: DeliveryStream) -> Result<(), AmqpError> {
        while let Some(delivery) = next_delivery(&self.queue, &mut deliveries).await? {
            let delivery_tag = delivery.envelope.delivery_tag;

            match self.answer(delivery).await {
                Ok(()) => self.transport.ack(delivery_tag, false).await?,
                Err(
                    AmqpError::HandlerError(_)
                    | AmqpError::ParsePayloadError(_)
                    | AmqpError::NotEncodableError(_),
                ) => {
                    warn!(queue = self.queue, "dropping request that could not be answered");
                    self.transport.reject(delivery_tag, false).await?;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    async fn answer(&self, delivery: Delivery) -> Result<(), AmqpError> {
        let mut span = otel::consumer_span(&delivery.properties, &self.queue);

        let result = async {
            let marshaller = self.marshaller.get();
            let request = &delivery.properties;
            let reply = reply_properties(request);

            let body = marshaller.decode(&delivery.body)?;
            let value = self
                .handler
                .call(body, &reply, request)
                .await
                .map_err(handler_failure)?;

            match (request.reply_to(), request.correlation_id()) {
                (Some(reply_to), Some(_)) => {
                    let bytes = marshaller.encode(&value)?;
                    debug!(reply_to = reply_to.as_str(), "publishing rpc reply");
                    self.transport
                        .publish("", reply_to.as_str(), false, false, reply, bytes)
                        .await
                }
                _ => {
                    debug!(queue = self.queue, "request without reply address, handled as a cast");
                    Ok(())
                }
            }
        }
        .await;

        finish_span(&mut span, &result);
        result
    }
}

/// A request/response endpoint bound to its own queue.
pub struct RpcServer {
    exchange: String,
    routing_key: String,
    consumer_tag: String,
    responder: Arc<Responder>,
    bound: AtomicBool,
    state: Arc<Mutex<RpcServerState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Declares the server queue, its exchange and the binding between them.
    ///
    /// Without a name the broker generates an exclusive queue; a named server gets a
    /// transient auto-delete queue of that name.
    pub(crate) async fn declare(
        channel: &Channel,
        name: Option<&str>,
        options: &RpcServerOptions,
        handler: RpcHandler,
        inherited: Arc<dyn Marshaller>,
    ) -> Result<RpcServer, AmqpError> {
        if name.is_some_and(str::is_empty) {
            return Err(AmqpError::ConfigurationError(
                "rpc server name must not be empty".to_owned(),
            ));
        }

        let marshaller = MarshallerCell::resolve(options.marshaller.as_ref(), inherited)?;
        let transport = channel.transport().clone();

        let queue = transport
            .declare_queue(
                name.unwrap_or_default(),
                false,
                name.is_none(),
                true,
                FieldTable::default(),
            )
            .await?;

        let exchange = match &options.exchange {
            Some(exchange) => exchange.clone(),
            None => {
                let exchange = queue.strip_prefix("amq.").unwrap_or(&queue).to_owned();
                transport
                    .declare_exchange(
                        &exchange,
                        ExchangeKind::Direct,
                        false,
                        true,
                        FieldTable::default(),
                    )
                    .await?;
                exchange
            }
        };

        transport
            .bind_queue(&queue, &exchange, &options.routing_key)
            .await?;
        debug!(queue = queue, exchange = exchange, "rpc server declared");

        Ok(RpcServer {
            exchange,
            routing_key: options.routing_key.clone(),
            consumer_tag: format!("{}-{}", queue, Uuid::new_v4()),
            responder: Arc::new(Responder {
                queue,
                transport,
                marshaller: Arc::new(marshaller),
                handler,
            }),
            bound: AtomicBool::new(true),
            state: Arc::new(Mutex::new(RpcServerState::Idle)),
            task: Mutex::new(None),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.responder.queue
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn state(&self) -> RpcServerState {
        *self.state.lock()
    }

    pub fn marshaller(&self) -> Arc<dyn Marshaller> {
        self.responder.marshaller.get()
    }

    pub fn set_marshaller(&self, marshaller: &MarshallerSelector) -> Result<(), AmqpError> {
        self.responder.marshaller.set(marshaller)
    }

    /// Starts answering requests on a background task. Starting twice is a no-op.
    pub async fn start(&self) -> Result<(), AmqpError> {
        {
            let mut state = self.state.lock();
            if *state != RpcServerState::Idle {
                return Ok(());
            }
            *state = RpcServerState::Running;
        }

        let deliveries = match self
            .responder
            .transport
            .consume(&self.responder.queue, &self.consumer_tag, false)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(err) => {
                *self.state.lock() = RpcServerState::Idle;
                return Err(err);
            }
        };

        let responder = self.responder.clone();
        let state = self.state.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = responder.serve(deliveries).await {
                error!(error = err.to_string(), queue = responder.queue, "rpc server stopped");
            }
            *state.lock() = RpcServerState::Stopped;
        });
        *self.task.lock() = Some(task);

        Ok(())
    }

    /// Removes the binding between the server queue and its exchange. Idempotent.
    pub async fn unbind_queue(&self) -> Result<(), AmqpError> {
        if !self.bound.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.responder
            .transport
            .unbind_queue(&self.responder.queue, &self.exchange, &self.routing_key)
            .await
    }

    /// Stops answering requests and unbinds the queue. Idempotent.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let previous = std::mem::replace(&mut *self.state.lock(), RpcServerState::Stopped);

        if previous == RpcServerState::Running {
            if let Err(err) = self.responder.transport.cancel(&self.consumer_tag).await {
                warn!(error = err.to_string(), "error cancelling rpc server consumer");
            }
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }

        self.unbind_queue().await
    }
}
