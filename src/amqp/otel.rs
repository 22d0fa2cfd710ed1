// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Propagates trace context through AMQP message headers: the context of the
//! publishing task is injected on publish, and extracted again when the
//! message is delivered so the consumer span joins the producer's trace.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    Context,
};
use std::collections::BTreeMap;
use tracing::error;

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    /// Sets a trace context key-value pair in RabbitMQ message headers.
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Gets a trace context value from RabbitMQ message headers.
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

    /// Gets all keys in the RabbitMQ message headers.
    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the current trace context into `headers`.
pub(crate) fn inject_current(headers: &mut BTreeMap<ShortString, AMQPValue>) {
    let ctx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut RabbitMQTracePropagator::new(headers))
    });
}

/// Reads the producer's trace context from the message properties.
pub(crate) fn extract_context(props: &AMQPProperties) -> Context {
    let mut headers = props
        .headers()
        .clone()
        .unwrap_or_default()
        .inner()
        .clone();

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_lowercase_injected_keys_and_read_them_back() {
        let mut headers = BTreeMap::new();
        let mut propagator = RabbitMQTracePropagator::new(&mut headers);

        propagator.set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(propagator.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(propagator.keys(), vec!["traceparent"]);
    }

    #[test]
    fn should_ignore_non_string_headers() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("x-count"), AMQPValue::LongInt(3));
        let propagator = RabbitMQTracePropagator::new(&mut headers);

        assert_eq!(propagator.get("x-count"), None);
    }
}
