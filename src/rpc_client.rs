// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Client
//!
//! An [`RpcClient`] publishes requests to a fixed exchange and routing key and waits
//! for the matching reply on a private, broker-named reply queue. Replies are routed
//! to their caller by correlation id, so one client can serve concurrent calls.

use crate::{
    channel::Channel,
    dispatcher::next_delivery,
    errors::AmqpError,
    marshaller::{Marshaller, MarshallerCell, MarshallerSelector, Payload},
    otel,
    publisher::text_plain,
    transport::{Delivery, DeliveryStream, Transport},
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

type PendingCalls = Arc<Mutex<HashMap<String, oneshot::Sender<Delivery>>>>;

/// Options of an RPC client.
///
/// By default requests go through the default exchange and the client inherits the
/// marshaller and reply timeout of its connection.
#[derive(Debug, Clone, Default)]
pub struct RpcClientOptions {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) marshaller: Option<MarshallerSelector>,
    pub(crate) timeout: Option<Duration>,
}

impl RpcClientOptions {
    pub fn new() -> RpcClientOptions {
        RpcClientOptions::default()
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
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

    /// How long a call waits for its reply.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Builds the request properties from the caller's, keeping only the fields a request
/// may set. The correlation id and reply-to always come from the client.
fn request_properties(properties: Option<&BasicProperties>) -> BasicProperties {
    let mut request = text_plain();
    let Some(properties) = properties else {
        return request;
    };

    if let Some(content_type) = properties.content_type() {
        request = request.with_content_type(content_type.clone());
    }
    if let Some(content_encoding) = properties.content_encoding() {
        request = request.with_content_encoding(content_encoding.clone());
    }
    if let Some(delivery_mode) = properties.delivery_mode() {
        request = request.with_delivery_mode(*delivery_mode);
    }
    if let Some(priority) = properties.priority() {
        request = request.with_priority(*priority);
    }
    if let Some(user_id) = properties.user_id() {
        request = request.with_user_id(user_id.clone());
    }
    if let Some(app_id) = properties.app_id() {
        request = request.with_app_id(app_id.clone());
    }

    request
}

/// Hands replies to their callers until the reply consumer stops, then closes the client.
async fn route_replies(
    queue: String,
    mut deliveries: DeliveryStream,
    pending: PendingCalls,
    closed: Arc<AtomicBool>,
) {
    loop {
        let delivery = match next_delivery(&queue, &mut deliveries).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => break,
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "rpc reply consumer stopped");
                break;
            }
        };

        let Some(correlation_id) = delivery.properties.correlation_id().clone() else {
            warn!(queue = queue, "dropping reply without correlation id");
            continue;
        };

        match pending.lock().remove(correlation_id.as_str()) {
            Some(caller) => {
                let _ = caller.send(delivery);
            }
            None => warn!(
                correlation_id = correlation_id.as_str(),
                "dropping reply nobody waits for"
            ),
        }
    }

    closed.store(true, Ordering::SeqCst);
    pending.lock().clear();
}

/// A request/response caller with its own reply queue.
pub struct RpcClient {
    name: String,
    exchange: String,
    routing_key: String,
    reply_queue: String,
    consumer_tag: String,
    timeout: Duration,
    transport: Arc<dyn Transport>,
    marshaller: MarshallerCell,
    pending: PendingCalls,
    closed: Arc<AtomicBool>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Declares the reply queue and starts routing replies.
    pub(crate) async fn declare(
        channel: &Channel,
        name: &str,
        options: &RpcClientOptions,
        inherited: Arc<dyn Marshaller>,
        default_timeout: Duration,
    ) -> Result<RpcClient, AmqpError> {
        if name.is_empty() {
            return Err(AmqpError::ConfigurationError(
                "rpc client name must not be empty".to_owned(),
            ));
        }

        let marshaller = MarshallerCell::resolve(options.marshaller.as_ref(), inherited)?;
        let transport = channel.transport().clone();

        let reply_queue = transport
            .declare_queue("", false, true, true, FieldTable::default())
            .await?;
        let consumer_tag = format!("{}-{}", name, Uuid::new_v4());
        let deliveries = transport.consume(&reply_queue, &consumer_tag, true).await?;
        debug!(name = name, reply_queue = reply_queue, "rpc client declared");

        let pending = PendingCalls::default();
        let closed = Arc::new(AtomicBool::new(false));
        let router = tokio::spawn(route_replies(
            reply_queue.clone(),
            deliveries,
            pending.clone(),
            closed.clone(),
        ));

        Ok(RpcClient {
            name: name.to_owned(),
            exchange: options.exchange.clone(),
            routing_key: options.routing_key.clone(),
            reply_queue,
            consumer_tag,
            timeout: options.timeout.unwrap_or(default_timeout),
            transport,
            marshaller,
            pending,
            closed,
            router: Mutex::new(Some(router)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub fn marshaller(&self) -> Arc<dyn Marshaller> {
        self.marshaller.get()
    }

    pub fn set_marshaller(&self, marshaller: &MarshallerSelector) -> Result<(), AmqpError> {
        self.marshaller.set(marshaller)
    }

    /// Sends a request and waits for its reply.
    ///
    /// Fails with `RpcTimeoutError` when no reply arrives in time and with
    /// `RpcClosedError` when the client is closed meanwhile.
    pub async fn call(
        &self,
        body: impl Into<Payload>,
        properties: Option<BasicProperties>,
    ) -> Result<Payload, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::RpcClosedError(self.name.clone()));
        }

        let marshaller = self.marshaller.get();
        let bytes = marshaller.encode(&body.into())?;

        let correlation_id = Uuid::new_v4().to_string();
        let properties = request_properties(properties.as_ref())
            .with_correlation_id(ShortString::from(correlation_id.clone()))
            .with_reply_to(ShortString::from(self.reply_queue.clone()));

        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(correlation_id.clone(), sender);

        debug!(
            exchange = self.exchange,
            routing_key = self.routing_key,
            correlation_id = correlation_id,
            "sending rpc request"
        );
        if let Err(err) = self
            .transport
            .publish(
                &self.exchange,
                &self.routing_key,
                false,
                false,
                otel::inject_context(properties),
                bytes,
            )
            .await
        {
            self.pending.lock().remove(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(reply)) => marshaller.decode(&reply.body),
            Ok(Err(_)) => Err(AmqpError::RpcClosedError(self.name.clone())),
            Err(_) => {
                self.pending.lock().remove(&correlation_id);
                error!(correlation_id = correlation_id, "rpc call timed out");
                Err(AmqpError::RpcTimeoutError(correlation_id))
            }
        }
    }

    /// Stops routing replies; pending calls fail with `RpcClosedError`. Idempotent.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cancelled = self.transport.cancel(&self.consumer_tag).await;
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        self.pending.lock().clear();

        cancelled
    }
}
