// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumer
//!
//! Pulls deliveries from a queue one at a time, hands each decoded event to
//! an [`EventHandler`] and settles the delivery according to the outcome:
//!
//! | Outcome                                   | Ledger                         | Delivery         |
//! |-------------------------------------------|--------------------------------|------------------|
//! | success                                   | active ticket completed        | ack              |
//! | retryable, no ticket, immediate retry left | untouched                      | nack, requeue    |
//! | retryable otherwise                       | failure recorded               | nack, discard    |
//! | non-retryable                             | ticket exhausted, dead letter  | nack, discard    |
//! | undecodable payload                       | untouched                      | nack, discard    |
//!
//! Whenever the ledger or the dead letter store cannot be written, the
//! delivery is requeued instead so the broker keeps the message.

use crate::{
    broker::{Broker, Delivery, DeliveryStream},
    errors::{BrokerError, HandlerError},
    event::Event,
    retry::RetryScheduler,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedSpan},
    trace::{Span, SpanKind, Status, Tracer},
    KeyValue,
};
use std::{borrow::Cow, collections::HashMap, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Keys with spent immediate retries a worker remembers at most
const MAX_TRACKED_REQUEUES: usize = 1_024;

/// Application logic run for every delivered event.
///
/// Handlers must be idempotent on [`Event::idempotency_key`]: delivery is at
/// least once.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    NackedRequeue,
    NackedDiscard,
}

pub struct QueueConsumer {
    broker: Arc<dyn Broker>,
    scheduler: Arc<RetryScheduler>,
    max_immediate_retries: u32,
}

impl QueueConsumer {
    pub fn new(broker: Arc<dyn Broker>, scheduler: Arc<RetryScheduler>) -> QueueConsumer {
        QueueConsumer {
            broker,
            scheduler,
            max_immediate_retries: 1,
        }
    }

    /// Requeues allowed for a retryable failure before the ledger takes over.
    pub fn with_max_immediate_retries(mut self, retries: u32) -> Self {
        self.max_immediate_retries = retries;
        self
    }

    /// Starts consuming `queue` on a dedicated task.
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, BrokerError> {
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let deliveries = self.broker.consume(queue, &consumer_tag).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Worker {
            queue: queue.to_owned(),
            handler,
            scheduler: self.scheduler.clone(),
            max_immediate_retries: self.max_immediate_retries,
            requeued: HashMap::new(),
        };

        info!(queue, consumer_tag, "subscription started");

        Ok(Subscription {
            consumer_tag,
            queue: queue.to_owned(),
            broker: self.broker.clone(),
            stop: stop_tx,
            worker: tokio::spawn(worker.run(deliveries, stop_rx)),
        })
    }
}

/// A running consumer on one queue.
///
/// Dropping it stops the worker after the message in hand without
/// cancelling at the broker; prefer [`Subscription::unsubscribe`].
pub struct Subscription {
    consumer_tag: String,
    queue: String,
    broker: Arc<dyn Broker>,
    stop: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl Subscription {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// `true` once the worker task has exited, e.g. after the broker closed
    /// the delivery stream.
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Cancels the consumer at the broker, waits for the event in hand to be
    /// handled and settled, then releases the consumer's resources.
    pub async fn unsubscribe(self) -> Result<(), BrokerError> {
        let cancelled = self.broker.cancel(&self.consumer_tag).await;
        let _ = self.stop.send(true);

        if let Err(err) = self.worker.await {
            error!(error = err.to_string(), queue = %self.queue, "consumer task failed");
        }

        self.broker.release(&self.consumer_tag).await?;
        info!(queue = %self.queue, consumer_tag = %self.consumer_tag, "subscription stopped");
        cancelled
    }
}

struct Worker {
    queue: String,
    handler: Arc<dyn EventHandler>,
    scheduler: Arc<RetryScheduler>,
    max_immediate_retries: u32,
    /// Immediate requeues spent per idempotency key, reset whenever a first
    /// delivery arrives
    requeued: HashMap<String, u32>,
}

impl Worker {
    async fn run(mut self, mut deliveries: DeliveryStream, mut stop: watch::Receiver<bool>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.changed() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.process(delivery).await;
                }
                Some(Err(err)) => error!(error = err.to_string(), queue = %self.queue, "errors consume msg"),
                None => {
                    debug!(queue = %self.queue, "delivery stream closed");
                    break;
                }
            }
        }
    }

    async fn process(&mut self, delivery: Delivery) -> Disposition {
        let tracer = global::tracer("amqp consumer");
        let mut span = tracer
            .span_builder(Cow::from(format!("{} receive", delivery.routing_key)))
            .with_kind(SpanKind::Consumer)
            .start_with_context(&tracer, &delivery.context);

        let event = match Event::from_bytes(&delivery.payload) {
            Ok(event) => event,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = %self.queue,
                    routing_key = %delivery.routing_key,
                    "undecodable payload, removing message from queue"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("undecodable payload"),
                });
                return settle(&delivery, Disposition::NackedDiscard, &mut span).await;
            }
        };

        // a requeued copy always comes back flagged as redelivered
        if !delivery.redelivered || self.requeued.len() >= MAX_TRACKED_REQUEUES {
            self.requeued.clear();
        }

        span.set_attribute(KeyValue::new("idempotency_key", event.idempotency_key.clone()));
        debug!(
            queue = %self.queue,
            event_type = %event.event_type,
            idempotency_key = %event.idempotency_key,
            redelivered = delivery.redelivered,
            "received event"
        );

        let disposition = match self.handler.handle(&event).await {
            Ok(()) => {
                self.requeued.remove(&event.idempotency_key);
                self.on_success(&event).await
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.cause.clone()),
                });

                if err.retryable {
                    self.on_retryable(&event, &err).await
                } else {
                    self.requeued.remove(&event.idempotency_key);
                    self.on_fatal(&event, &err).await
                }
            }
        };

        if disposition == Disposition::Acked {
            span.set_status(Status::Ok);
        }

        settle(&delivery, disposition, &mut span).await
    }

    async fn on_success(&self, event: &Event) -> Disposition {
        let completed = match self.scheduler.active_ticket(&event.idempotency_key).await {
            Ok(None) => Ok(()),
            Ok(Some(ticket)) => self.scheduler.complete(ticket.id).await.map(|_| ()),
            Err(err) => Err(err),
        };

        match completed {
            Ok(()) => Disposition::Acked,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    idempotency_key = %event.idempotency_key,
                    "failure to complete retry ticket, requeuing"
                );
                Disposition::NackedRequeue
            }
        }
    }

    async fn on_retryable(&mut self, event: &Event, failure: &HandlerError) -> Disposition {
        let key = &event.idempotency_key;
        let used = self.requeued.get(key).copied().unwrap_or_default();

        let ticket = match self.scheduler.active_ticket(key).await {
            Ok(ticket) => ticket,
            Err(err) => {
                error!(error = err.to_string(), idempotency_key = %key, "retry ledger unavailable, requeuing");
                return Disposition::NackedRequeue;
            }
        };

        if ticket.is_none() && used < self.max_immediate_retries {
            warn!(
                error = %failure,
                idempotency_key = %key,
                attempt = used + 1,
                "error whiling handling msg, requeuing for latter"
            );
            self.requeued.insert(key.clone(), used + 1);
            return Disposition::NackedRequeue;
        }

        self.requeued.remove(key);

        match self.scheduler.record_failure(event, &failure.cause).await {
            Ok(ticket) => {
                warn!(
                    error = %failure,
                    ticket_id = %ticket.id,
                    attempt = ticket.attempt_count,
                    next_attempt_at = %ticket.next_attempt_at,
                    "event handed to the retry ledger"
                );
                Disposition::NackedDiscard
            }
            Err(err) => {
                error!(error = err.to_string(), idempotency_key = %key, "failure to record retry, requeuing");
                Disposition::NackedRequeue
            }
        }
    }

    async fn on_fatal(&self, event: &Event, failure: &HandlerError) -> Disposition {
        let reason = format!("non-retryable failure: {}", failure.cause);

        let stored = match self.scheduler.active_ticket(&event.idempotency_key).await {
            Ok(Some(ticket)) => self.scheduler.exhaust(ticket.id, &reason).await.map(|_| ()),
            Ok(None) => self.scheduler.dead_letter().handle(event, None, &reason).await,
            Err(err) => Err(err),
        };

        match stored {
            Ok(()) => {
                error!(
                    error = %failure,
                    idempotency_key = %event.idempotency_key,
                    "non-retryable failure, event dead-lettered"
                );
                Disposition::NackedDiscard
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    idempotency_key = %event.idempotency_key,
                    "failure to dead-letter event, requeuing"
                );
                Disposition::NackedRequeue
            }
        }
    }
}

async fn settle(delivery: &Delivery, disposition: Disposition, span: &mut BoxedSpan) -> Disposition {
    let result = match disposition {
        Disposition::Acked => delivery.ack().await,
        Disposition::NackedRequeue => delivery.nack(true).await,
        Disposition::NackedDiscard => delivery.nack(false).await,
    };

    if let Err(err) = result {
        error!(error = err.to_string(), ?disposition, "error whiling settling msg");
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from("error to settle msg"),
        });
    }

    disposition
}
