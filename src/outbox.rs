// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outbox Relay
//!
//! Publishes events that were staged in the outbox table together with the
//! business write that produced them. Rows are sent oldest first with the
//! idempotency key they were stored with, and marked published only after
//! the broker confirmed them, so a crash between the two steps produces a
//! duplicate delivery rather than a lost event.

use crate::{errors::PublishError, publisher::EventPublisher, retry::ticker, store::OutboxStore};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_BATCH_SIZE: usize = 100;

/// Outcome of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    pub unroutable: usize,
}

pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<EventPublisher>,
    batch_size: usize,
    poll_interval: Duration,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn OutboxStore>, publisher: Arc<EventPublisher>, poll_interval: Duration) -> Self {
        OutboxRelay {
            store,
            publisher,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Publishes one batch of staged events.
    ///
    /// Stops at the first broker outage and leaves the rest for the next
    /// pass. Unroutable rows are logged and left unpublished for an operator.
    pub async fn relay_once(&self) -> Result<RelayReport, PublishError> {
        let mut report = RelayReport::default();

        let pending = self
            .store
            .pending_outbox(self.batch_size)
            .await
            .map_err(|err| PublishError::Unreachable(err.to_string()))?;

        for record in pending {
            match self.publisher.send(&record.event).await {
                Ok(()) => {
                    if let Err(err) = self.store.mark_outbox_published(record.id, Utc::now()).await {
                        // the row is sent again on the next pass
                        error!(error = err.to_string(), outbox_id = %record.id, "failure to mark outbox row published");
                        return Err(PublishError::Unreachable(err.to_string()));
                    }
                    report.published += 1;
                }
                Err(PublishError::Unroutable(key)) => {
                    warn!(
                        outbox_id = %record.id,
                        routing_key = %key,
                        "outbox event is unroutable, leaving it for an operator"
                    );
                    report.unroutable += 1;
                }
                Err(err) => {
                    error!(error = err.to_string(), outbox_id = %record.id, "outbox relay interrupted");
                    return Err(err);
                }
            }
        }

        Ok(report)
    }

    /// Relays on a fixed interval until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = ticker(self.poll_interval);

        info!(interval = ?self.poll_interval, "outbox relay started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.relay_once().await {
                        Ok(report) if report.published > 0 => {
                            info!(published = report.published, unroutable = report.unroutable, "outbox relayed");
                        }
                        Ok(_) => {}
                        Err(err) => error!(error = err.to_string(), "outbox relay failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{Broker, InMemoryBroker},
        event::Event,
        store::InMemoryStore,
        topology::TopicBinding,
    };
    use serde_json::json;

    async fn setup() -> (Arc<InMemoryBroker>, Arc<InMemoryStore>, OutboxRelay) {
        let bindings = vec![TopicBinding::new("requests", "pa.request.*")];
        let broker = Arc::new(InMemoryBroker::new("events"));
        broker.declare_topology(&bindings).await.unwrap();
        let store = Arc::new(InMemoryStore::new());
        let publisher = Arc::new(EventPublisher::new(broker.clone(), bindings));
        let relay = OutboxRelay::new(store.clone(), publisher, Duration::from_millis(10));
        (broker, store, relay)
    }

    #[tokio::test]
    async fn should_publish_staged_events_once() {
        let (broker, store, relay) = setup().await;
        store
            .insert_outbox(&Event::new("pa.request.created", "req-1", json!({})))
            .await
            .unwrap();

        let first = relay.relay_once().await.unwrap();
        let second = relay.relay_once().await.unwrap();

        assert_eq!(first.published, 1);
        assert_eq!(second, RelayReport::default());
        assert_eq!(broker.queue_depth("requests"), 1);
    }

    #[tokio::test]
    async fn should_leave_unroutable_rows_pending() {
        let (broker, store, relay) = setup().await;
        store
            .insert_outbox(&Event::new("pa.audit.event", "req-1", json!({})))
            .await
            .unwrap();
        store
            .insert_outbox(&Event::new("pa.request.created", "req-1", json!({})))
            .await
            .unwrap();

        let report = relay.relay_once().await.unwrap();

        assert_eq!(report, RelayReport { published: 1, unroutable: 1 });
        assert_eq!(store.pending_outbox(10).await.unwrap().len(), 1);
        assert_eq!(broker.queue_depth("requests"), 1);
    }

    #[tokio::test]
    async fn should_stop_batch_when_broker_is_down() {
        let (broker, store, relay) = setup().await;
        for subject in ["req-1", "req-2"] {
            store
                .insert_outbox(&Event::new("pa.request.created", subject, json!({})))
                .await
                .unwrap();
        }
        broker.set_reachable(false);

        let err = relay.relay_once().await.unwrap_err();

        assert!(matches!(err, PublishError::Unreachable(_)));
        assert_eq!(store.pending_outbox(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn should_run_with_zero_poll_interval() {
        let (broker, store, _) = setup().await;
        let publisher = Arc::new(EventPublisher::new(
            broker.clone(),
            vec![TopicBinding::new("requests", "pa.request.*")],
        ));
        let relay = Arc::new(OutboxRelay::new(store.clone(), publisher, Duration::ZERO));
        store
            .insert_outbox(&Event::new("pa.request.created", "req-1", json!({})))
            .await
            .unwrap();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let relay = relay.clone();
            async move { relay.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broker.queue_depth("requests"), 1);
    }
}
