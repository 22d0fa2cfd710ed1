// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module handles the creation of the AMQP connection and its channels.
//! The connection is created once at startup and owned by the broker adapter;
//! connection-level errors are logged and published on a `watch` channel so
//! the process supervisor can decide whether to restart.

use crate::{broker::ConnectionState, config::AmqpConfig, errors::BrokerError};
use lapin::{
    options::{BasicQosOptions, ConfirmSelectOptions},
    types::LongString,
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

use super::map_lapin_error;

/// Opens an AMQP connection using the parameters in `cfg`.
///
/// # Parameters
/// * `cfg` - Broker configuration containing the URL and the connection name
///
/// # Returns
/// * `Result<(Connection, Arc<watch::Sender<ConnectionState>>), BrokerError>` -
///   The connection and the sender that tracks its state
pub(crate) async fn new_amqp_connection(
    cfg: &AmqpConfig,
) -> Result<(Connection, Arc<watch::Sender<ConnectionState>>), BrokerError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.url, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(BrokerError::Unreachable(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    let (state_tx, _) = watch::channel(ConnectionState::Connected);
    let state_tx = Arc::new(state_tx);

    let on_error_tx = state_tx.clone();
    conn.on_error(move |err| {
        error!(error = err.to_string(), "amqp connection error");
        on_error_tx.send_replace(ConnectionState::Failed(err.to_string()));
    });

    Ok((conn, state_tx))
}

/// Creates the channel used for publishing, with publisher confirms enabled
/// so a publish only succeeds once the broker has taken the message.
pub(crate) async fn new_publish_channel(conn: &Connection) -> Result<Channel, BrokerError> {
    debug!("creating amqp publish channel...");
    let channel = new_channel(conn).await?;

    channel
        .confirm_select(ConfirmSelectOptions { nowait: false })
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            map_lapin_error(err)
        })?;

    debug!("publish channel created");
    Ok(channel)
}

/// Creates a channel dedicated to one consumer, delivering a single
/// unacknowledged message at a time.
pub(crate) async fn new_consumer_channel(conn: &Connection) -> Result<Channel, BrokerError> {
    let channel = new_channel(conn).await?;

    channel
        .basic_qos(1, BasicQosOptions { global: false })
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "failure to configure qos");
            map_lapin_error(err)
        })?;

    Ok(channel)
}

pub(crate) async fn new_channel(conn: &Connection) -> Result<Channel, BrokerError> {
    match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(map_lapin_error(err))
        }
    }
}
