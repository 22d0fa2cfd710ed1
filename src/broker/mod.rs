// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Adapter
//!
//! The `Broker` trait is the narrow surface the rest of the backbone uses to
//! talk to a topic-routed, manual-ack message broker. Consumption is modelled
//! as a pull stream of [`Delivery`] values: the adapter never acknowledges a
//! message on its own, the queue consumer decides between ack and nack.
//!
//! Two implementations ship with the crate: [`crate::amqp::AmqpBroker`] for
//! RabbitMQ and [`InMemoryBroker`] for tests and local development.

mod memory;

pub use memory::InMemoryBroker;

use crate::{errors::BrokerError, topology::TopicBinding};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use opentelemetry::Context;
use std::{fmt, sync::Arc};
use tokio::sync::watch;

/// Default content type of published events
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Stream of deliveries for one consumer registration.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Options attached to a single publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Marks the message durable so it survives a broker restart
    pub persistent: bool,
    pub message_id: Option<String>,
    pub message_type: Option<String>,
}

impl PublishOptions {
    pub fn persistent() -> Self {
        PublishOptions {
            persistent: true,
            ..Default::default()
        }
    }
}

/// Observable state of the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Closed,
    Failed(String),
}

/// Settles a delivered message with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message handed to a consumer, awaiting an explicit ack or nack.
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    /// Trace context propagated by the producer, if any
    pub context: Context,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        routing_key: &str,
        redelivered: bool,
        payload: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Delivery {
        Delivery {
            delivery_tag,
            routing_key: routing_key.to_owned(),
            redelivered,
            payload,
            context: Context::new(),
            acker,
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Removes the message from the queue permanently.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Rejects the message; with `requeue` it goes back to the front of the
    /// same queue, otherwise it leaves the live queue.
    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Interface of a topic-exchange broker with manual acknowledgement.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares the exchange, the queues and their bindings.
    ///
    /// Safe to call on every startup. Fails with
    /// [`BrokerError::TopologyConflict`] when something already exists with
    /// incompatible parameters.
    async fn declare_topology(&self, bindings: &[TopicBinding]) -> Result<(), BrokerError>;

    /// Publishes `payload` to the topic exchange under `routing_key`.
    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        opts: PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Registers a consumer on `queue` and returns its delivery stream.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    /// Stops new deliveries to the consumer registered under `consumer_tag`.
    ///
    /// Deliveries already handed out can still be acked or nacked until
    /// [`Broker::release`] is called for the same tag.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Frees the resources held for a cancelled consumer.
    async fn release(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Releases every consumer, channel and the connection. Idempotent.
    async fn close(&self) -> Result<(), BrokerError>;

    /// Watches the state of the underlying connection.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
}
