// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Client
//!
//! This module provides the single error type shared by every layer of the client:
//! the validation failures raised before any transport side effect (marshaller,
//! option and durability checks), the failures reported by the underlying transport,
//! and the failures surfacing from consumer dispatch and RPC calls.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Validation variants (`InvalidMarshallerError`, `IncompatibleOptionsError`,
/// `NotEncodableError`, `PersistenceMismatchError`, `ConfigurationError`) are always
/// raised synchronously at the offending call, before anything is sent to the broker.
/// The remaining variants wrap a failure reported by the transport or by application
/// code running inside a consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server, or using a closed one
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// A marshaller failed the encode/decode capability check
    #[error("invalid marshaller `{0}`")]
    InvalidMarshallerError(String),

    /// A re-declared entity or a binding conflicts with existing options
    #[error("incompatible options `{0}`")]
    IncompatibleOptionsError(String),

    /// The marshalled body cannot be represented as raw bytes
    #[error("message cannot be converted to bytes for publishing `{0}`")]
    NotEncodableError(String),

    /// A persistent publish was attempted against a non-durable target
    #[error("can only publish persistent message to durable `{0}`")]
    PersistenceMismatchError(String),

    /// Malformed constructor or operation arguments
    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error removing a binding between an exchange and a queue
    #[error("failure to unbind exchange `{0}` from queue `{1}`")]
    UnbindingError(String, String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error fetching a single message from a queue
    #[error("failure to get message from `{0}`")]
    GetMessageError(String),

    /// Error decoding a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message `{0}`")]
    RejectMessageError(String),

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error deleting a queue
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// Error deleting an exchange
    #[error("failure to delete exchange `{0}`")]
    DeleteExchangeError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// The blocking fetch of a consumer was interrupted; loops retry on it
    #[error("consumer interrupted")]
    Interrupted,

    /// An application handler returned an error
    #[error("handler failure `{0}`")]
    HandlerError(String),

    /// No reply arrived for an RPC call in time
    #[error("rpc call timed out `{0}`")]
    RpcTimeoutError(String),

    /// The RPC client was closed while a call was in flight
    #[error("rpc client closed `{0}`")]
    RpcClosedError(String),

    /// Error closing the channel or connection
    #[error("failure to close `{0}`")]
    CloseError(String),
}
