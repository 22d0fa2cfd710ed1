// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Background worker of the event backbone: declares the workflow topology,
//! then runs the retry sweep and the outbox relay until interrupted.
//!
//! The process exits with a failure status when the broker connection is
//! lost, leaving the restart to the process supervisor.

use pa_events::{
    amqp::AmqpBroker,
    broker::{Broker, ConnectionState},
    config::Config,
    dead_letter::DeadLetterHandler,
    errors::{BrokerError, ConfigError, StoreError},
    logging,
    outbox::OutboxRelay,
    publisher::EventPublisher,
    retry::RetryScheduler,
    store::PostgresStore,
    topology::workflow_bindings,
};
use std::{process::ExitCode, sync::Arc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    logging::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = err.to_string(), "worker stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), WorkerError> {
    let cfg = Config::from_env()?;

    let store = Arc::new(PostgresStore::connect(&cfg.database_url).await?);
    store.migrate().await?;

    let broker = Arc::new(AmqpBroker::connect(&cfg.amqp).await?);
    let bindings = workflow_bindings(&cfg.amqp.queue_prefix);
    broker.declare_topology(&bindings).await?;
    info!(exchange = %cfg.amqp.exchange, queues = bindings.len(), "topology declared");

    let publisher = Arc::new(EventPublisher::new(broker.clone(), bindings));
    let dead_letter = Arc::new(DeadLetterHandler::new(store.clone(), cfg.dead_letter.clone()));
    let scheduler = Arc::new(
        RetryScheduler::new(store.clone(), publisher.clone(), dead_letter, cfg.retry.clone())
            .with_settings(cfg.scheduler.clone()),
    );
    let relay = Arc::new(OutboxRelay::new(store.clone(), publisher, cfg.outbox_poll_interval));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { scheduler.run(shutdown).await }
    });
    let relay_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { relay.run(shutdown).await }
    });

    let mut connection = broker.connection_state();
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = err.to_string(), "failure to listen for the interrupt signal");
            }
            info!("shutdown requested");
            Ok(())
        }
        reason = connection_lost(&mut connection) => Err(WorkerError::ConnectionLost(reason)),
    };

    let _ = shutdown_tx.send(true);
    for task in [scheduler_task, relay_task] {
        if let Err(err) = task.await {
            error!(error = err.to_string(), "background task failed");
        }
    }

    if let Err(err) = broker.close().await {
        warn!(error = err.to_string(), "broker not closed cleanly");
    }
    store.pool().close().await;

    outcome
}

async fn connection_lost(state: &mut watch::Receiver<ConnectionState>) -> String {
    loop {
        let current = state.borrow_and_update().clone();
        if let ConnectionState::Failed(reason) = current {
            return reason;
        }
        if state.changed().await.is_err() {
            return "connection state unavailable".to_owned();
        }
    }
}
