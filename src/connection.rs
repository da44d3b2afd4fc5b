// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection
//!
//! A [`Connection`] is the entry point of the crate. It owns the channel to the broker,
//! the marshaller every entity inherits by default and the registries of declared
//! exchanges, queues and RPC endpoints.
//!
//! ```no_run
//! # async fn run() -> Result<(), rabbitmq_client::errors::AmqpError> {
//! use rabbitmq_client::{
//!     config::RabbitMQConfigs, connection::Connection, exchange::ExchangeOptions,
//!     publisher::PublishOptions, queue::QueueOptions,
//! };
//!
//! let connection = Connection::open(RabbitMQConfigs::default()).await?;
//! let exchange = connection.topic("orders", ExchangeOptions::new()).await?;
//! let queue = connection.queue("orders.created", QueueOptions::new()).await?;
//! queue.bind(&exchange, "orders.created.*").await?;
//!
//! exchange
//!     .publish("order 42", "orders.created.eu", PublishOptions::new())
//!     .await?;
//! connection.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    channel::{new_amqp_channel, Channel},
    config::RabbitMQConfigs,
    errors::AmqpError,
    exchange::{Exchange, ExchangeKind, ExchangeOptions},
    marshaller::{select_marshaller, Marshaller, MarshallerCell, MarshallerSelector},
    queue::{Queue, QueueOptions},
    rpc_client::{RpcClient, RpcClientOptions},
    rpc_server::{RpcHandler, RpcServer, RpcServerOptions},
    topology::Topology,
    transport::{ConfirmListener, ReturnListener, Transport},
};
use parking_lot::RwLock;
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error};

pub struct Connection {
    config: RabbitMQConfigs,
    provided: Option<Arc<dyn Transport>>,
    marshaller: MarshallerCell,
    channel: RwLock<Option<Arc<Channel>>>,
    lifecycle: Mutex<()>,
    topology: Topology,
    rpc_servers: Mutex<HashMap<String, Arc<RpcServer>>>,
    rpc_clients: Mutex<HashMap<String, Arc<RpcClient>>>,
}

impl Connection {
    /// Builds a connection to the broker described by `config`.
    ///
    /// Connects right away unless `auto_connect` is off.
    pub async fn open(config: RabbitMQConfigs) -> Result<Connection, AmqpError> {
        Connection::build(config, None).await
    }

    /// Builds a connection running over an already established transport session.
    pub async fn with_transport(
        config: RabbitMQConfigs,
        transport: Arc<dyn Transport>,
    ) -> Result<Connection, AmqpError> {
        Connection::build(config, Some(transport)).await
    }

    async fn build(
        config: RabbitMQConfigs,
        provided: Option<Arc<dyn Transport>>,
    ) -> Result<Connection, AmqpError> {
        let marshaller = MarshallerCell::new(select_marshaller(&config.marshaller)?);

        let connection = Connection {
            config,
            provided,
            marshaller,
            channel: RwLock::new(None),
            lifecycle: Mutex::new(()),
            topology: Topology::default(),
            rpc_servers: Mutex::new(HashMap::new()),
            rpc_clients: Mutex::new(HashMap::new()),
        };

        if connection.config.auto_connect {
            connection.connect().await?;
        }

        Ok(connection)
    }

    /// Opens the channel to the broker. Connecting twice is a no-op.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.connected() {
            return Ok(());
        }

        let channel = match &self.provided {
            Some(transport) => Arc::new(Channel::new(
                transport.clone(),
                self.config.feedback_timeout,
            )),
            None => new_amqp_channel(&self.config).await?,
        };

        *self.channel.write() = Some(channel);
        debug!(name = self.config.connection_name, "connection established");
        Ok(())
    }

    pub fn connected(&self) -> bool {
        self.channel.read().is_some()
    }

    /// The channel of the connection, failing when disconnected.
    pub fn channel(&self) -> Result<Arc<Channel>, AmqpError> {
        self.channel
            .read()
            .clone()
            .ok_or_else(|| AmqpError::ConnectionError("not connected".to_owned()))
    }

    pub fn config(&self) -> &RabbitMQConfigs {
        &self.config
    }

    pub fn marshaller(&self) -> Arc<dyn Marshaller> {
        self.marshaller.get()
    }

    /// Replaces the marshaller inherited by entities declared from now on.
    pub fn set_marshaller(&self, marshaller: &MarshallerSelector) -> Result<(), AmqpError> {
        self.marshaller.set(marshaller)
    }

    /// Declares a queue, or returns the registered one when the options agree.
    pub async fn queue(&self, name: &str, options: QueueOptions) -> Result<Arc<Queue>, AmqpError> {
        let channel = self.channel()?;
        self.topology
            .queue(channel, name, &options, self.marshaller.get())
            .await
    }

    /// Declares an exchange, or returns the registered one when the options agree.
    pub async fn exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<Arc<Exchange>, AmqpError> {
        let channel = self.channel()?;
        self.topology
            .exchange(channel, name, kind, &options, self.marshaller.get())
            .await
    }

    pub async fn direct(
        &self,
        name: &str,
        options: ExchangeOptions,
    ) -> Result<Arc<Exchange>, AmqpError> {
        self.exchange(name, ExchangeKind::Direct, options).await
    }

    pub async fn fanout(
        &self,
        name: &str,
        options: ExchangeOptions,
    ) -> Result<Arc<Exchange>, AmqpError> {
        self.exchange(name, ExchangeKind::Fanout, options).await
    }

    pub async fn topic(
        &self,
        name: &str,
        options: ExchangeOptions,
    ) -> Result<Arc<Exchange>, AmqpError> {
        self.exchange(name, ExchangeKind::Topic, options).await
    }

    pub async fn headers(
        &self,
        name: &str,
        options: ExchangeOptions,
    ) -> Result<Arc<Exchange>, AmqpError> {
        self.exchange(name, ExchangeKind::Headers, options).await
    }

    pub async fn find_queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.topology.find_queue(name).await
    }

    pub async fn find_exchange(&self, name: &str) -> Option<Arc<Exchange>> {
        self.topology.find_exchange(name).await
    }

    pub async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        let channel = self.channel()?;
        self.topology.delete_queue(&channel, name).await
    }

    pub async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        let channel = self.channel()?;
        self.topology.delete_exchange(&channel, name).await
    }

    /// Registers the callback for messages the broker returns as unroutable.
    pub fn on_return(&self, listener: Option<ReturnListener>) -> Result<(), AmqpError> {
        self.channel()?.on_return(listener);
        Ok(())
    }

    /// Registers the callback for publisher confirms.
    pub fn on_confirm(&self, listener: Option<ConfirmListener>) -> Result<(), AmqpError> {
        self.channel()?.on_confirm(listener);
        Ok(())
    }

    pub async fn enable_confirms(&self) -> Result<(), AmqpError> {
        self.channel()?.enable_confirms().await
    }

    /// Declares and starts an RPC server.
    ///
    /// The server is registered under `name`, or under its generated queue name when
    /// unnamed. Declaring a registered name returns the running server.
    pub async fn rpc_server(
        &self,
        name: Option<&str>,
        options: RpcServerOptions,
        handler: RpcHandler,
    ) -> Result<Arc<RpcServer>, AmqpError> {
        let channel = self.channel()?;
        let mut servers = self.rpc_servers.lock().await;

        if let Some(server) = name.and_then(|name| servers.get(name)) {
            return Ok(server.clone());
        }

        let server = Arc::new(
            RpcServer::declare(&channel, name, &options, handler, self.marshaller.get()).await?,
        );
        server.start().await?;

        let key = name.unwrap_or(server.queue_name()).to_owned();
        servers.insert(key, server.clone());
        Ok(server)
    }

    /// Declares an RPC client, or returns the registered one of that name.
    pub async fn rpc_client(
        &self,
        name: &str,
        options: RpcClientOptions,
    ) -> Result<Arc<RpcClient>, AmqpError> {
        let channel = self.channel()?;
        let mut clients = self.rpc_clients.lock().await;

        if let Some(client) = clients.get(name) {
            return Ok(client.clone());
        }

        let client = Arc::new(
            RpcClient::declare(
                &channel,
                name,
                &options,
                self.marshaller.get(),
                self.config.rpc_timeout,
            )
            .await?,
        );
        clients.insert(name.to_owned(), client.clone());
        Ok(client)
    }

    pub async fn find_rpc_server(&self, name: &str) -> Option<Arc<RpcServer>> {
        self.rpc_servers.lock().await.get(name).cloned()
    }

    pub async fn find_rpc_client(&self, name: &str) -> Option<Arc<RpcClient>> {
        self.rpc_clients.lock().await.get(name).cloned()
    }

    /// Closes and forgets an RPC server. Unknown names are ignored.
    pub async fn delete_rpc_server(&self, name: &str) -> Result<(), AmqpError> {
        let server = self.rpc_servers.lock().await.remove(name);
        match server {
            Some(server) => server.close().await,
            None => Ok(()),
        }
    }

    /// Unbinds every queue, closes the RPC endpoints and the channel, then forgets every
    /// declared entity. Disconnecting twice is a no-op.
    ///
    /// Every step runs even when an earlier one fails; the first failure is returned.
    pub async fn disconnect(&self) -> Result<(), AmqpError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(channel) = self.channel.write().take() else {
            return Ok(());
        };

        let mut outcome = Ok(());
        let mut keep_first = |result: Result<(), AmqpError>| {
            if let Err(err) = result {
                error!(error = err.to_string(), "error while disconnecting");
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        };

        for queue in self.topology.queues().await {
            keep_first(queue.unbind_all().await);
        }
        for (_, server) in self.rpc_servers.lock().await.drain() {
            keep_first(server.close().await);
        }
        for (_, client) in self.rpc_clients.lock().await.drain() {
            keep_first(client.close().await);
        }
        keep_first(channel.close().await);

        self.topology.clear().await;
        debug!(name = self.config.connection_name, "connection closed");
        outcome
    }

    /// Runs `scope` and disconnects afterwards, whatever its outcome.
    pub async fn scoped<F, Fut, T>(self: Arc<Self>, scope: F) -> Result<T, AmqpError>
    where
        F: FnOnce(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let result = scope(self.clone()).await;
        let closed = self.disconnect().await;

        let value = result?;
        closed?;
        Ok(value)
    }
}
