// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels inside the AMQP header table: published messages carry the
//! current context, and every dispatched delivery opens a consumer span continuing it.

use crate::errors::AmqpError;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan},
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

const TRACER_NAME: &str = "rabbitmq-client";

/// Writes trace context entries into an AMQP header table.
struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads trace context entries out of an AMQP header table.
struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Adds the current trace context to the headers of outgoing properties.
pub(crate) fn inject_context(properties: BasicProperties) -> BasicProperties {
    let mut headers = properties
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();
    let before = headers.len();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(
            &Context::current(),
            &mut HeaderInjector {
                headers: &mut headers,
            },
        )
    });

    if headers.len() == before {
        return properties;
    }

    properties.with_headers(FieldTable::from(headers))
}

/// Opens a consumer span for a delivery, continuing the context found in its headers.
pub(crate) fn consumer_span(properties: &BasicProperties, name: &str) -> BoxedSpan {
    let headers = properties
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor { headers: &headers })
    });

    let tracer = global::tracer(TRACER_NAME);
    tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &ctx)
}

/// Marks a consumer span as failed.
pub(crate) fn record_failure(span: &mut BoxedSpan, err: &AmqpError) {
    span.record_error(err);
    span.set_status(Status::Error {
        description: Cow::from(err.to_string()),
    });
}
