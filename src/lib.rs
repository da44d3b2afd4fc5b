// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client
//!
//! An application-level RabbitMQ client: a [`connection::Connection`] declares
//! exchanges and queues, publishes with optional broker feedback, consumes with three
//! dispatch strategies and offers request/response endpoints on top of AMQP.

mod otel;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod lapin_transport;
pub mod marshaller;
pub mod publisher;
pub mod queue;
pub mod rpc_client;
pub mod rpc_server;
pub mod topology;
pub mod transport;
