// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Publisher
//!
//! Builds event envelopes and hands them to the broker adapter. A routing key
//! that none of the static topic bindings match is rejected before it ever
//! reaches the broker; a broker-side return is reported the same way.
//!
//! Building and sending are separate steps (`prepare` and `send`) so an event
//! can first be staged in the transactional outbox and published later with
//! the idempotency key it was stored with.

use crate::{
    broker::{Broker, PublishOptions},
    errors::PublishError,
    event::{Actor, DomainEvent, Event},
    topology::TopicBinding,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    bindings: Vec<TopicBinding>,
}

impl EventPublisher {
    /// Creates a publisher for the topology described by `bindings`.
    pub fn new(broker: Arc<dyn Broker>, bindings: Vec<TopicBinding>) -> EventPublisher {
        EventPublisher { broker, bindings }
    }

    pub fn bindings(&self) -> &[TopicBinding] {
        &self.bindings
    }

    /// Builds an event without publishing it.
    pub fn prepare(&self, event_type: &str, subject_id: &str, payload: Value) -> Event {
        Event::new(event_type, subject_id, payload)
    }

    /// Builds and publishes an event, returning it once the broker accepted it.
    pub async fn publish(
        &self,
        event_type: &str,
        subject_id: &str,
        payload: Value,
    ) -> Result<Event, PublishError> {
        let event = self.prepare(event_type, subject_id, payload);
        self.send(&event).await?;
        Ok(event)
    }

    /// Publishes a typed workflow event on behalf of `actor`.
    pub async fn publish_domain(
        &self,
        subject_id: &str,
        event: &DomainEvent,
        actor: Option<Actor>,
    ) -> Result<Event, PublishError> {
        let payload = event
            .payload()
            .map_err(|err| PublishError::Encoding(err.to_string()))?;

        let mut envelope = self.prepare(event.event_type(), subject_id, payload);
        if let Some(actor) = actor {
            envelope = envelope.with_actor(actor);
        }

        self.send(&envelope).await?;
        Ok(envelope)
    }

    /// Publishes an already built event verbatim, keeping its idempotency key
    /// and production time.
    pub async fn send(&self, event: &Event) -> Result<(), PublishError> {
        let routing_key = event.routing_key();

        if !self.bindings.iter().any(|b| b.matches(routing_key)) {
            error!(
                routing_key,
                idempotency_key = %event.idempotency_key,
                "no binding matches the routing key, event not published"
            );
            return Err(PublishError::Unroutable(routing_key.to_owned()));
        }

        let payload = event
            .to_bytes()
            .map_err(|err| PublishError::Encoding(err.to_string()))?;

        let opts = PublishOptions {
            persistent: true,
            message_id: Some(event.idempotency_key.clone()),
            message_type: Some(event.event_type.clone()),
        };

        match self.broker.publish(routing_key, &payload, opts).await {
            Err(err) => {
                error!(error = err.to_string(), routing_key, "error publishing event");
                Err(PublishError::from(err))
            }
            Ok(()) => {
                debug!(routing_key, idempotency_key = %event.idempotency_key, "event published");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBroker,
        errors::BrokerError,
        event::{ActorKind, RequestSubmitted, SubmissionMethod},
    };
    use mockall::predicate::{always, eq};
    use serde_json::json;

    fn bindings() -> Vec<TopicBinding> {
        vec![TopicBinding::new("cms_pa_request", "pa.request.*")]
    }

    #[tokio::test]
    async fn should_publish_persistently_under_event_type() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .with(eq("pa.request.submitted"), always(), always())
            .times(1)
            .returning(|_, payload, opts| {
                let event = Event::from_bytes(payload).unwrap();
                assert!(opts.persistent);
                assert_eq!(opts.message_id.as_deref(), Some(event.idempotency_key.as_str()));
                assert_eq!(opts.message_type.as_deref(), Some("pa.request.submitted"));
                Ok(())
            });

        let publisher = EventPublisher::new(Arc::new(broker), bindings());
        let event = publisher
            .publish("pa.request.submitted", "req-1", json!({ "payerId": "p-9" }))
            .await
            .unwrap();

        assert_eq!(event.subject_id, "req-1");
        assert_eq!(event.routing_key(), "pa.request.submitted");
    }

    #[tokio::test]
    async fn should_reject_key_without_binding_before_broker() {
        let mut broker = MockBroker::new();
        broker.expect_publish().never();

        let publisher = EventPublisher::new(Arc::new(broker), bindings());
        let err = publisher
            .publish("pa.audit.event", "req-1", json!({}))
            .await
            .unwrap_err();

        assert_eq!(err, PublishError::Unroutable("pa.audit.event".to_owned()));
    }

    #[tokio::test]
    async fn should_surface_broker_outage_without_retrying() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .times(1)
            .returning(|_, _, _| Err(BrokerError::Unreachable("connection reset".to_owned())));

        let publisher = EventPublisher::new(Arc::new(broker), bindings());
        let err = publisher
            .publish("pa.request.created", "req-1", json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Unreachable(_)));
    }

    #[tokio::test]
    async fn should_keep_key_and_time_of_prepared_event() {
        let mut broker = MockBroker::new();
        broker.expect_publish().times(1).returning(|_, payload, _| {
            let event = Event::from_bytes(payload).unwrap();
            assert_eq!(event.idempotency_key, "outbox-key");
            Ok(())
        });

        let publisher = EventPublisher::new(Arc::new(broker), bindings());
        let prepared = publisher
            .prepare("pa.request.updated", "req-1", json!({ "field": "status" }))
            .with_idempotency_key("outbox-key");

        publisher.send(&prepared).await.unwrap();
    }

    #[tokio::test]
    async fn should_publish_domain_event_with_actor() {
        let mut broker = MockBroker::new();
        broker.expect_publish().times(1).returning(|_, payload, _| {
            let event = Event::from_bytes(payload).unwrap();
            assert_eq!(event.actor.unwrap().id, "user-7");
            Ok(())
        });

        let publisher = EventPublisher::new(Arc::new(broker), bindings());
        let domain = DomainEvent::RequestSubmitted(RequestSubmitted {
            request_id: "req-1".to_owned(),
            tracking_id: "TRK-1".to_owned(),
            submission_method: SubmissionMethod::Fhir,
            payer_id: "payer-1".to_owned(),
        });
        let actor = Actor {
            id: "user-7".to_owned(),
            kind: ActorKind::User,
            roles: vec!["provider".to_owned()],
        };

        let event = publisher
            .publish_domain("req-1", &domain, Some(actor))
            .await
            .unwrap();

        assert_eq!(event.event_type, "pa.request.submitted");
        assert_eq!(event.decode().unwrap(), domain);
    }
}
