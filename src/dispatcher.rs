// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatch Strategies
//!
//! Three mutually exclusive ways of attaching application code to a queue:
//! - `subscribe`: a standing consumer drained by a spawned task, every delivery acked
//!   once its handler returned
//! - `loop_subscribe`: the same contract, drained on the caller's own task until the
//!   caller drops or aborts the future
//! - `reactive_loop_subscribe`: a caller-side loop whose handler receives a
//!   [`ReactiveMessage`](crate::consumer::ReactiveMessage) and may ack or reject it
//!
//! An interrupted fetch is retried. Any other transport error, a decode failure or a
//! handler failure ends the loop with that error.

use crate::{
    consumer::{self, DeliveryHandler, ReactiveHandler},
    errors::AmqpError,
    marshaller::MarshallerCell,
    transport::{Delivery, DeliveryStream, Transport},
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lifecycle of a standing consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unregistered,
    Registered,
    Consuming,
    Cancelled,
    Closed,
}

/// Options of `reactive_loop_subscribe`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReactiveOptions {
    pub(crate) auto_ack: bool,
}

impl ReactiveOptions {
    pub fn new() -> ReactiveOptions {
        ReactiveOptions::default()
    }

    /// Lets the broker consider deliveries acknowledged as soon as they are sent.
    ///
    /// The loop never acknowledges in this mode and handlers must not ack or reject.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }
}

/// Everything a consumer needs to know about the queue it drains.
#[derive(Clone)]
pub(crate) struct ConsumerSource {
    pub(crate) queue: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) marshaller: Arc<MarshallerCell>,
}

impl ConsumerSource {
    async fn register(&self, auto_ack: bool) -> Result<(String, DeliveryStream), AmqpError> {
        let consumer_tag = format!("{}-{}", self.queue, Uuid::new_v4());
        debug!(queue = self.queue, consumer_tag = consumer_tag, "registering consumer");

        let deliveries = self
            .transport
            .consume(&self.queue, &consumer_tag, auto_ack)
            .await?;

        Ok((consumer_tag, deliveries))
    }
}

/// Waits for the next delivery, retrying interrupted fetches.
///
/// Returns `None` once the consumer was cancelled.
pub(crate) async fn next_delivery(
    queue: &str,
    deliveries: &mut DeliveryStream,
) -> Result<Option<Delivery>, AmqpError> {
    loop {
        match deliveries.next().await {
            Some(Ok(delivery)) => return Ok(Some(delivery)),
            Some(Err(AmqpError::Interrupted)) => {
                warn!(queue = queue, "consumer interrupted, waiting for next delivery");
            }
            Some(Err(err)) => {
                error!(error = err.to_string(), queue = queue, "errors consume msg");
                return Err(err);
            }
            None => return Ok(None),
        }
    }
}

/// Handle of a consumer registered with `subscribe`.
pub struct ConsumerHandle {
    consumer_tag: String,
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<ConsumerState>>,
    task: JoinHandle<Result<(), AmqpError>>,
}

impl ConsumerHandle {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    /// Stops the broker from sending new deliveries to this consumer.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        if matches!(
            self.state(),
            ConsumerState::Cancelled | ConsumerState::Closed
        ) {
            return Ok(());
        }

        self.transport.cancel(&self.consumer_tag).await?;
        *self.state.lock() = ConsumerState::Cancelled;
        Ok(())
    }

    /// Waits for the consumer task to end and returns the error that ended it, if any.
    pub async fn join(self) -> Result<(), AmqpError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                error!(error = err.to_string(), "consumer task failure");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
        }
    }
}

fn settle(state: &Mutex<ConsumerState>) {
    let mut state = state.lock();
    if *state != ConsumerState::Cancelled {
        *state = ConsumerState::Closed;
    }
}

/// Registers a standing consumer and drains it on a spawned task.
pub(crate) async fn subscribe(
    source: ConsumerSource,
    handler: DeliveryHandler,
) -> Result<ConsumerHandle, AmqpError> {
    let state = Arc::new(Mutex::new(ConsumerState::Unregistered));
    let (consumer_tag, mut deliveries) = source.register(false).await?;
    *state.lock() = ConsumerState::Registered;

    let transport = source.transport.clone();
    let task_state = state.clone();
    let task = tokio::spawn(async move {
        let result = async {
            while let Some(delivery) = next_delivery(&source.queue, &mut deliveries).await? {
                *task_state.lock() = ConsumerState::Consuming;
                let marshaller = source.marshaller.get();
                consumer::consume(
                    &source.queue,
                    &source.transport,
                    marshaller.as_ref(),
                    delivery,
                    &handler,
                )
                .await?;
            }
            Ok::<(), AmqpError>(())
        }
        .await;

        settle(&task_state);
        if let Err(err) = &result {
            error!(error = err.to_string(), queue = source.queue, "consumer stopped");
        }
        result
    });

    Ok(ConsumerHandle {
        consumer_tag,
        transport,
        state,
        task,
    })
}

/// Registers a standing consumer and drains it on the caller's task.
///
/// Runs until the consumer is cancelled or fails; callers stop it by dropping the future.
pub(crate) async fn loop_subscribe(
    source: &ConsumerSource,
    handler: &DeliveryHandler,
) -> Result<(), AmqpError> {
    let (_, mut deliveries) = source.register(false).await?;

    while let Some(delivery) = next_delivery(&source.queue, &mut deliveries).await? {
        let marshaller = source.marshaller.get();
        consumer::consume(
            &source.queue,
            &source.transport,
            marshaller.as_ref(),
            delivery,
            handler,
        )
        .await?;
    }

    Ok(())
}

/// Like `loop_subscribe`, with handlers in charge of acknowledging.
pub(crate) async fn reactive_loop_subscribe(
    source: &ConsumerSource,
    handler: &ReactiveHandler,
    options: ReactiveOptions,
) -> Result<(), AmqpError> {
    let (_, mut deliveries) = source.register(options.auto_ack).await?;

    while let Some(delivery) = next_delivery(&source.queue, &mut deliveries).await? {
        let marshaller = source.marshaller.get();
        consumer::consume_reactive(
            &source.queue,
            &source.transport,
            marshaller.as_ref(),
            delivery,
            handler,
            options.auto_ack,
        )
        .await?;
    }

    Ok(())
}
