// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Installation
//!
//! Declares a [`Topology`] on a channel: the topic exchange first, then every
//! queue with its TTL and length arguments, then the queue bindings.
//! Declarations are idempotent on the broker side; a re-declaration with
//! different parameters is answered with `PRECONDITION_FAILED`, which is
//! surfaced as [`BrokerError::TopologyConflict`].

use crate::{errors::BrokerError, topology::Topology};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, ShortString},
    Channel, ExchangeKind,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

use super::map_lapin_error;

/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Installs the topology on the broker.
///
/// This method performs the following operations in order:
/// 1. Creates the topic exchange
/// 2. Creates all queues
/// 3. Sets up queue-to-exchange bindings
///
/// # Returns
/// Ok(()) on success or BrokerError on failure
pub(crate) async fn install(channel: &Channel, topology: &Topology) -> Result<(), BrokerError> {
    install_exchange(channel, topology).await?;
    install_queues(channel, topology).await?;
    binding_queues(channel, topology).await
}

async fn install_exchange(channel: &Channel, topology: &Topology) -> Result<(), BrokerError> {
    let exch = topology.exchange();
    debug!("creating exchange: {}", exch.name);

    match channel
        .exchange_declare(
            &exch.name,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                passive: false,
                durable: exch.durable,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = %exch.name,
                "error to declare the exchange"
            );
            Err(map_lapin_error(err))
        }
        _ => Ok(()),
    }?;

    debug!("exchange: {} was created", exch.name);
    Ok(())
}

async fn install_queues(channel: &Channel, topology: &Topology) -> Result<(), BrokerError> {
    for def in topology.queues() {
        debug!("creating queue: {}", def.name);

        let mut queue_args = BTreeMap::new();

        if let Some(ttl) = def.ttl {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = def.max_length {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        match channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::from(queue_args),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(map_lapin_error(err))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }?;
    }

    Ok(())
}

async fn binding_queues(channel: &Channel, topology: &Topology) -> Result<(), BrokerError> {
    let exchange = &topology.exchange().name;

    for binding in topology.bindings() {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, exchange, binding.routing_key_pattern
        );

        match channel
            .queue_bind(
                &binding.queue_name,
                exchange,
                &binding.routing_key_pattern,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(map_lapin_error(err))
            }
            _ => Ok(()),
        }?;
    }

    debug!("queues were bound");

    Ok(())
}
