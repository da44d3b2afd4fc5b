// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Marshalling
//!
//! Every entity that moves a payload across the wire owns a marshaller: a pair of
//! functions turning an application value into the bytes sent to the broker and back.
//! Three configurations are recognized:
//! - `Disable`: raw bytes (or text) pass through untouched
//! - `Unspecified`: the built-in JSON marshaller
//! - `Custom`: any implementation of the [`Marshaller`] trait
//!
//! All of them are resolved through [`select_marshaller`], which validates custom
//! marshallers once, at assignment time.

use crate::errors::AmqpError;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, sync::Arc};

const SAMPLE: &str = "marshaller sample ✓ 人大";

/// An application-level message body.
///
/// `Bytes` carries an opaque binary body, `Value` a structured one. Text is a
/// `Value::String` and is the only structured value that can travel without a
/// marshaller.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Value(serde_json::Value),
}

impl Payload {
    /// Builds a structured payload out of any serializable value.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, AmqpError> {
        serde_json::to_value(value)
            .map(Payload::Value)
            .map_err(|err| AmqpError::NotEncodableError(err.to_string()))
    }

    /// Deserializes the payload into a concrete type.
    ///
    /// Structured payloads are converted directly, binary payloads are parsed as JSON.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        match self {
            Payload::Value(value) => serde_json::from_value(value.clone()),
            Payload::Bytes(bytes) => serde_json::from_slice(bytes),
        }
        .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    /// Returns the payload as text, when it is text or valid UTF-8 bytes.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Value(serde_json::Value::String(text)) => Some(text),
            Payload::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Returns the raw byte form of the payload, if it has one.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            Payload::Value(serde_json::Value::String(text)) => Some(text.as_bytes()),
            _ => None,
        }
    }

    /// Converts the payload into the byte representation required by the transport.
    ///
    /// Fails with `NotEncodableError` for structured values other than text.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        match self.as_bytes() {
            Some(bytes) => Ok(bytes.to_vec()),
            None => Err(AmqpError::NotEncodableError(format!("{:?}", self))),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Value(serde_json::Value::String(value.to_owned()))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Value(serde_json::Value::String(value))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::Bytes(value.to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Value(value)
    }
}

/// The encode/decode pair converting an application value to and from wire bytes.
pub trait Marshaller: Send + Sync {
    /// Converts a payload into the bytes handed to the transport.
    fn encode(&self, value: &Payload) -> Result<Vec<u8>, AmqpError>;

    /// Converts the bytes of a delivery back into a payload.
    fn decode(&self, bytes: &[u8]) -> Result<Payload, AmqpError>;
}

/// Pass-through marshaller used when marshalling is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityMarshaller;

impl Marshaller for IdentityMarshaller {
    fn encode(&self, value: &Payload) -> Result<Vec<u8>, AmqpError> {
        value.to_bytes()
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, AmqpError> {
        Ok(Payload::Bytes(bytes.to_vec()))
    }
}

/// The built-in marshaller: structured values travel as JSON documents.
///
/// Binary payloads are refused; they should use the disabled marshaller instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn encode(&self, value: &Payload) -> Result<Vec<u8>, AmqpError> {
        match value {
            Payload::Value(value) => serde_json::to_vec(value)
                .map_err(|err| AmqpError::NotEncodableError(err.to_string())),
            Payload::Bytes(_) => Err(AmqpError::NotEncodableError(
                "raw bytes cannot be marshalled as json".to_owned(),
            )),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, AmqpError> {
        serde_json::from_slice(bytes)
            .map(Payload::Value)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}

/// The marshaller requested by a connection, an entity or an RPC endpoint.
#[derive(Clone, Default)]
pub enum MarshallerSelector {
    /// Bodies pass through as raw bytes
    Disable,
    /// The built-in JSON marshaller
    #[default]
    Unspecified,
    /// An application supplied marshaller
    Custom(Arc<dyn Marshaller>),
}

impl fmt::Debug for MarshallerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshallerSelector::Disable => f.write_str("Disable"),
            MarshallerSelector::Unspecified => f.write_str("Unspecified"),
            MarshallerSelector::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Resolves a marshaller selector into a usable marshaller.
///
/// Custom marshallers must encode a text sample and decode their own output, otherwise
/// the selection fails with `InvalidMarshallerError`.
pub fn select_marshaller(requested: &MarshallerSelector) -> Result<Arc<dyn Marshaller>, AmqpError> {
    match requested {
        MarshallerSelector::Disable => Ok(Arc::new(IdentityMarshaller)),
        MarshallerSelector::Unspecified => Ok(Arc::new(JsonMarshaller)),
        MarshallerSelector::Custom(marshaller) => {
            validate(marshaller.as_ref())?;
            Ok(marshaller.clone())
        }
    }
}

fn validate(marshaller: &dyn Marshaller) -> Result<(), AmqpError> {
    let encoded = marshaller
        .encode(&Payload::from(SAMPLE))
        .map_err(|err| AmqpError::InvalidMarshallerError(format!("encode: {}", err)))?;

    marshaller
        .decode(&encoded)
        .map(|_| ())
        .map_err(|err| AmqpError::InvalidMarshallerError(format!("decode: {}", err)))
}

/// Holds the current marshaller of an entity.
///
/// Replacement validates first and swaps under the write lock, so readers only ever
/// observe a validated marshaller.
pub(crate) struct MarshallerCell {
    inner: RwLock<Arc<dyn Marshaller>>,
}

impl MarshallerCell {
    pub(crate) fn new(marshaller: Arc<dyn Marshaller>) -> Self {
        MarshallerCell {
            inner: RwLock::new(marshaller),
        }
    }

    /// Resolves an optional selector, falling back to an inherited marshaller.
    pub(crate) fn resolve(
        requested: Option<&MarshallerSelector>,
        inherited: Arc<dyn Marshaller>,
    ) -> Result<Self, AmqpError> {
        match requested {
            Some(selector) => Ok(MarshallerCell::new(select_marshaller(selector)?)),
            None => Ok(MarshallerCell::new(inherited)),
        }
    }

    pub(crate) fn get(&self) -> Arc<dyn Marshaller> {
        self.inner.read().clone()
    }

    pub(crate) fn set(&self, requested: &MarshallerSelector) -> Result<(), AmqpError> {
        let marshaller = select_marshaller(requested)?;
        *self.inner.write() = marshaller;
        Ok(())
    }
}
