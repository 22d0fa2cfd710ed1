// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Broker Adapter
//!
//! [`AmqpBroker`] implements [`Broker`] on top of `lapin`. It owns one
//! connection, a confirm-mode channel for publishing, and one channel per
//! consumer registration so a slow handler never holds up publishing and
//! cancelling one consumer cannot disturb another.
//!
//! The adapter never reconnects by itself; connection errors are logged and
//! published through [`Broker::connection_state`].

mod channel;
mod install;
pub(crate) mod otel;

pub use install::{AMQP_HEADERS_MAX_LENGTH, AMQP_HEADERS_MESSAGE_TTL};

use crate::{
    broker::{
        Acknowledger, Broker, ConnectionState, Delivery, DeliveryStream, PublishOptions,
        JSON_CONTENT_TYPE,
    },
    config::AmqpConfig,
    errors::BrokerError,
    topology::{QueueSettings, TopicBinding, Topology},
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// AMQP reply code for a normal shutdown
const REPLY_SUCCESS: u16 = 200;

/// Maps a lapin error onto the broker error taxonomy.
pub(crate) fn map_lapin_error(err: lapin::Error) -> BrokerError {
    match &err {
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::Unreachable(err.to_string())
        }
        lapin::Error::ProtocolError(amqp)
            if matches!(
                amqp.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
            ) =>
        {
            BrokerError::TopologyConflict(err.to_string())
        }
        _ => BrokerError::ProtocolError(err.to_string()),
    }
}

/// RabbitMQ implementation of the [`Broker`] trait.
pub struct AmqpBroker {
    connection: Connection,
    publish_channel: Channel,
    exchange: String,
    settings: QueueSettings,
    consumers: Mutex<HashMap<String, Channel>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    closed: AtomicBool,
}

impl AmqpBroker {
    /// Connects to the broker described by `cfg`.
    ///
    /// The returned adapter is the single owner of the connection: create it
    /// at startup, share it behind an `Arc`, and call [`Broker::close`] at
    /// shutdown.
    pub async fn connect(cfg: &AmqpConfig) -> Result<AmqpBroker, BrokerError> {
        let (connection, state_tx) = channel::new_amqp_connection(cfg).await?;
        let publish_channel = channel::new_publish_channel(&connection).await?;

        Ok(AmqpBroker {
            connection,
            publish_channel,
            exchange: cfg.exchange.clone(),
            settings: cfg.queue,
            consumers: Mutex::new(HashMap::new()),
            state_tx,
            closed: AtomicBool::new(false),
        })
    }

    fn consumer_channel(&self, consumer_tag: &str) -> Option<Channel> {
        self.consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(consumer_tag)
            .cloned()
    }

    fn take_consumer(&self, consumer_tag: &str) -> Option<Channel> {
        self.consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(consumer_tag)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_topology(&self, bindings: &[TopicBinding]) -> Result<(), BrokerError> {
        let topology = Topology::build(&self.exchange, self.settings, bindings);

        // a failed declaration closes the channel it ran on
        let channel = channel::new_channel(&self.connection).await?;
        let result = install::install(&channel, &topology).await;

        if channel.status().connected() {
            if let Err(err) = channel.close(REPLY_SUCCESS, "topology declared").await {
                warn!(error = err.to_string(), "failure to close topology channel");
            }
        }

        result
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        opts: PublishOptions,
    ) -> Result<(), BrokerError> {
        let mut headers = BTreeMap::new();
        otel::inject_current(&mut headers);

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(if opts.persistent { 2 } else { 1 })
            .with_timestamp(Utc::now().timestamp().max(0) as u64)
            .with_headers(FieldTable::from(headers));

        if let Some(id) = opts.message_id {
            props = props.with_message_id(ShortString::from(id));
        }
        if let Some(kind) = opts.message_type {
            props = props.with_type(ShortString::from(kind));
        }

        let confirm = self
            .publish_channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                payload,
                props,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), routing_key, "error publishing message");
                map_lapin_error(err)
            })?;

        match confirm.await.map_err(map_lapin_error)? {
            Confirmation::Ack(Some(_returned)) => {
                warn!(routing_key, "message returned by the broker, no queue bound");
                Err(BrokerError::Unroutable(routing_key.to_owned()))
            }
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => {
                error!(routing_key, "broker refused the message");
                Err(BrokerError::ProtocolError(format!(
                    "broker nacked message `{}`",
                    routing_key
                )))
            }
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let channel = channel::new_consumer_channel(&self.connection).await?;

        let consumer = match channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(map_lapin_error(err))
            }
            Ok(c) => Ok(c),
        }?;

        self.consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(consumer_tag.to_owned(), channel);

        debug!(queue, consumer_tag, "consumer registered");

        Ok(consumer
            .map(|result| result.map(into_delivery).map_err(map_lapin_error))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let Some(channel) = self.consumer_channel(consumer_tag) else {
            return Ok(());
        };

        // the channel stays open so in-flight deliveries can still be settled
        channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "failure to cancel consumer");
                map_lapin_error(err)
            })
    }

    async fn release(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let Some(channel) = self.take_consumer(consumer_tag) else {
            return Ok(());
        };

        match channel.close(REPLY_SUCCESS, "consumer released").await {
            Ok(()) | Err(lapin::Error::InvalidChannelState(_)) => Ok(()),
            Err(err) => {
                debug!(error = err.to_string(), consumer_tag, "failure to close consumer channel");
                Err(map_lapin_error(err))
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tags: Vec<String> = self
            .consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        stop_consumers(self, &tags).await;

        if let Err(err) = self.publish_channel.close(REPLY_SUCCESS, "shutdown").await {
            debug!(error = err.to_string(), "publish channel already closed");
        }

        let result = match self.connection.close(REPLY_SUCCESS, "shutdown").await {
            Ok(()) => Ok(()),
            Err(lapin::Error::InvalidConnectionState(_)) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "failure to close the connection");
                Err(map_lapin_error(err))
            }
        };

        self.state_tx.send_replace(ConnectionState::Closed);
        debug!("amqp connection closed");
        result
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

/// Cancels then releases every consumer in `tags`, carrying on past
/// failures. Returns how many did not stop cleanly.
async fn stop_consumers(broker: &dyn Broker, tags: &[String]) -> usize {
    let mut unclean = 0;

    for tag in tags {
        let mut clean = true;
        if let Err(err) = broker.cancel(tag).await {
            warn!(error = err.to_string(), consumer_tag = %tag, "consumer not cancelled cleanly");
            clean = false;
        }
        if let Err(err) = broker.release(tag).await {
            warn!(error = err.to_string(), consumer_tag = %tag, "consumer channel not released cleanly");
            clean = false;
        }
        if !clean {
            unclean += 1;
        }
    }

    unclean
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let context = otel::extract_context(&delivery.properties);
    let routing_key = delivery.routing_key.to_string();

    Delivery::new(
        delivery.delivery_tag,
        &routing_key,
        delivery.redelivered,
        delivery.data,
        Arc::new(LapinAcker(delivery.acker)),
    )
    .with_context(context)
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                map_lapin_error(err)
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), requeue, "error whiling nack msg");
                map_lapin_error(err)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use mockall::predicate::eq;

    #[test]
    fn should_map_io_errors_to_unreachable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = map_lapin_error(lapin::Error::IOError(Arc::new(io)));

        assert!(matches!(err, BrokerError::Unreachable(_)));
    }

    #[tokio::test]
    async fn should_release_every_consumer_even_when_one_fails() {
        let mut broker = MockBroker::new();
        broker.expect_cancel().times(2).returning(|_| Ok(()));
        broker
            .expect_release()
            .with(eq("requests-1"))
            .times(1)
            .returning(|_| Err(BrokerError::ProtocolError("channel closed by peer".to_owned())));
        broker
            .expect_release()
            .with(eq("requests-2"))
            .times(1)
            .returning(|_| Ok(()));

        let tags = vec!["requests-1".to_owned(), "requests-2".to_owned()];
        let unclean = stop_consumers(&broker, &tags).await;

        assert_eq!(unclean, 1);
    }
}
