// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! A [`Channel`] owns one transport session and the broker-level listeners attached to
//! it. Exchanges, queues, consumers and RPC endpoints all share the channel of the
//! connection that created them.

use crate::{
    config::RabbitMQConfigs,
    errors::AmqpError,
    lapin_transport::LapinTransport,
    transport::{ConfirmListener, ReturnListener, Transport},
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tracing::debug;

pub struct Channel {
    transport: Arc<dyn Transport>,
    return_listener: Mutex<Option<ReturnListener>>,
    confirm_listener: Mutex<Option<ConfirmListener>>,
    pub(crate) feedback_lock: tokio::sync::Mutex<()>,
    pub(crate) feedback_timeout: Duration,
}

impl Channel {
    pub(crate) fn new(transport: Arc<dyn Transport>, feedback_timeout: Duration) -> Channel {
        Channel {
            transport,
            return_listener: Mutex::new(None),
            confirm_listener: Mutex::new(None),
            feedback_lock: tokio::sync::Mutex::new(()),
            feedback_timeout,
        }
    }

    /// The transport session backing this channel.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Registers the channel-wide callback for messages returned by the broker.
    ///
    /// The last registration wins; `None` removes the callback.
    pub fn on_return(&self, listener: Option<ReturnListener>) {
        *self.return_listener.lock() = listener.clone();
        self.transport.register_return_listener(listener);
    }

    /// Registers the channel-wide callback for publisher confirms.
    ///
    /// The last registration wins; `None` removes the callback.
    pub fn on_confirm(&self, listener: Option<ConfirmListener>) {
        *self.confirm_listener.lock() = listener.clone();
        self.transport.register_confirm_listener(listener);
    }

    /// Puts the channel in publisher confirm mode.
    pub async fn enable_confirms(&self) -> Result<(), AmqpError> {
        debug!("enabling publisher confirms");
        self.transport.confirm_select().await
    }

    /// Reinstalls the application callbacks after a feedback-awaiting publish.
    pub(crate) fn restore_listeners(&self) {
        self.transport
            .register_return_listener(self.return_listener.lock().clone());
        self.transport
            .register_confirm_listener(self.confirm_listener.lock().clone());
    }

    pub(crate) async fn close(&self) -> Result<(), AmqpError> {
        debug!("closing amqp channel...");
        self.transport.close().await
    }
}

/// Connects to RabbitMQ and creates the channel used by a connection.
///
/// # Example
/// ```no_run
/// # async fn run() -> Result<(), rabbitmq_client::errors::AmqpError> {
/// use rabbitmq_client::{channel::new_amqp_channel, config::RabbitMQConfigs};
///
/// let channel = new_amqp_channel(&RabbitMQConfigs::default()).await?;
/// # Ok(())
/// # }
/// ```
pub async fn new_amqp_channel(cfg: &RabbitMQConfigs) -> Result<Arc<Channel>, AmqpError> {
    let transport = LapinTransport::connect(cfg).await?;
    Ok(Arc::new(Channel::new(Arc::new(transport), cfg.feedback_timeout)))
}
