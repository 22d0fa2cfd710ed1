// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Model
//!
//! `Event` is the envelope that travels through the broker and the retry
//! ledger. Its payload is opaque JSON so any routing key can be published and
//! retried; `DomainEvent` is the typed view of the prior-authorization
//! workflow events, keyed by the same routing key the envelope carries in its
//! `type` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

/// Identity of the authenticated actor that caused an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub kind: ActorKind,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    User,
    System,
    Service,
    External,
}

/// Immutable event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub subject_id: String,
    pub payload: Value,
    pub produced_at: DateTime<Utc>,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
}

impl Event {
    /// Builds an event stamped with the current time and an idempotency key
    /// derived from its content.
    pub fn new(event_type: &str, subject_id: &str, payload: Value) -> Event {
        let idempotency_key = idempotency_key(event_type, subject_id, &payload);
        Event {
            event_type: event_type.to_owned(),
            subject_id: subject_id.to_owned(),
            payload,
            produced_at: Utc::now(),
            idempotency_key,
            actor: None,
        }
    }

    /// Replaces the derived key with one chosen by the caller.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    /// The routing key is the event type, verbatim.
    pub fn routing_key(&self) -> &str {
        &self.event_type
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Event, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Decodes the typed domain event, dispatching on the `type` tag.
    pub fn decode(&self) -> Result<DomainEvent, serde_json::Error> {
        serde_json::from_value(json!({ "type": self.event_type, "payload": self.payload }))
    }
}

/// Derives the idempotency key of an occurrence from its event type, subject
/// and payload.
///
/// The payload is hashed in its canonical JSON form (object keys ordered), so
/// republishing an unchanged tuple yields the same key. A payload that cannot
/// be rendered as JSON gets a random key instead.
pub fn idempotency_key<P: Serialize + ?Sized>(event_type: &str, subject_id: &str, payload: &P) -> String {
    let canonical = match serde_json::to_value(payload).and_then(|v| serde_json::to_vec(&v)) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = err.to_string(), event_type, "payload is not hashable, using a random key");
            return Uuid::new_v4().to_string();
        }
    };

    let mut hasher = Sha256::new();
    for part in [event_type.as_bytes(), subject_id.as_bytes(), canonical.as_slice()] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionMethod {
    Fhir,
    X12,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCreated {
    pub request_id: String,
    pub patient_id: String,
    pub provider_npi: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSubmitted {
    pub request_id: String,
    pub tracking_id: String,
    pub submission_method: SubmissionMethod,
    pub payer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestUpdated {
    pub request_id: String,
    pub status: String,
    #[serde(default)]
    pub changed_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceived {
    pub request_id: String,
    pub tracking_id: String,
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequired {
    pub request_id: String,
    pub issues: Vec<String>,
}

/// A workflow rule fired; conditions and actions are opaque to the backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTriggered {
    pub request_id: String,
    pub rule_id: String,
    pub actions: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequired {
    pub request_id: String,
    pub recipient: String,
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOccurred {
    pub request_id: String,
    pub code: String,
    pub message: String,
}

/// Typed events of the prior-authorization workflow, tagged by routing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DomainEvent {
    #[serde(rename = "pa.request.created")]
    RequestCreated(RequestCreated),
    #[serde(rename = "pa.request.submitted")]
    RequestSubmitted(RequestSubmitted),
    #[serde(rename = "pa.request.updated")]
    RequestUpdated(RequestUpdated),
    #[serde(rename = "pa.response.received")]
    ResponseReceived(ResponseReceived),
    #[serde(rename = "pa.validation.required")]
    ValidationRequired(ValidationRequired),
    #[serde(rename = "pa.workflow.triggered")]
    WorkflowTriggered(WorkflowTriggered),
    #[serde(rename = "pa.notification.required")]
    NotificationRequired(NotificationRequired),
    #[serde(rename = "pa.audit.event")]
    AuditEvent(AuditEvent),
    #[serde(rename = "pa.error.occurred")]
    ErrorOccurred(ErrorOccurred),
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::RequestCreated(_) => "pa.request.created",
            DomainEvent::RequestSubmitted(_) => "pa.request.submitted",
            DomainEvent::RequestUpdated(_) => "pa.request.updated",
            DomainEvent::ResponseReceived(_) => "pa.response.received",
            DomainEvent::ValidationRequired(_) => "pa.validation.required",
            DomainEvent::WorkflowTriggered(_) => "pa.workflow.triggered",
            DomainEvent::NotificationRequired(_) => "pa.notification.required",
            DomainEvent::AuditEvent(_) => "pa.audit.event",
            DomainEvent::ErrorOccurred(_) => "pa.error.occurred",
        }
    }

    /// Serializes the variant's own payload, without the tag.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            DomainEvent::RequestCreated(p) => serde_json::to_value(p),
            DomainEvent::RequestSubmitted(p) => serde_json::to_value(p),
            DomainEvent::RequestUpdated(p) => serde_json::to_value(p),
            DomainEvent::ResponseReceived(p) => serde_json::to_value(p),
            DomainEvent::ValidationRequired(p) => serde_json::to_value(p),
            DomainEvent::WorkflowTriggered(p) => serde_json::to_value(p),
            DomainEvent::NotificationRequired(p) => serde_json::to_value(p),
            DomainEvent::AuditEvent(p) => serde_json::to_value(p),
            DomainEvent::ErrorOccurred(p) => serde_json::to_value(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted() -> DomainEvent {
        DomainEvent::RequestSubmitted(RequestSubmitted {
            request_id: "PA-1".to_owned(),
            tracking_id: "TRK-1".to_owned(),
            submission_method: SubmissionMethod::Fhir,
            payer_id: "payer-9".to_owned(),
        })
    }

    #[test]
    fn should_derive_same_key_for_unchanged_tuple() {
        let a = idempotency_key("pa.request.submitted", "PA-1", &json!({"a": 1, "b": [1, 2]}));
        let b = idempotency_key("pa.request.submitted", "PA-1", &json!({"b": [1, 2], "a": 1}));

        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn should_derive_distinct_keys_for_distinct_inputs() {
        let inputs = [
            ("pa.request.submitted", "PA-1", json!({"a": 1})),
            ("pa.request.created", "PA-1", json!({"a": 1})),
            ("pa.request.submitted", "PA-2", json!({"a": 1})),
            ("pa.request.submitted", "PA-1", json!({"a": 2})),
            ("pa.request.submitted", "PA-1", json!(null)),
            ("pa.request.submittedPA", "-1", json!({"a": 1})),
        ];

        let mut keys: Vec<String> = inputs
            .iter()
            .map(|(t, s, p)| idempotency_key(t, s, p))
            .collect();
        keys.sort();
        keys.dedup();

        assert_eq!(keys.len(), inputs.len());
    }

    #[test]
    fn should_fall_back_to_random_key_when_payload_is_not_json() {
        use std::collections::HashMap;

        let mut payload = HashMap::new();
        payload.insert(vec![1u8], "tuple keys are not valid json object keys");

        let a = idempotency_key("pa.audit.event", "PA-1", &payload);
        let b = idempotency_key("pa.audit.event", "PA-1", &payload);

        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn should_decode_domain_event_from_envelope() {
        let domain = submitted();
        let event = Event::new(domain.event_type(), "PA-1", domain.payload().unwrap());

        assert_eq!(event.routing_key(), "pa.request.submitted");
        assert_eq!(event.decode().unwrap(), domain);
    }

    #[test]
    fn should_fail_decoding_unknown_type_but_keep_envelope() {
        let event = Event::new("pa.unknown.thing", "PA-1", json!({"x": 1}));

        let bytes = event.to_bytes().unwrap();
        let back = Event::from_bytes(&bytes).unwrap();

        assert_eq!(back, event);
        assert!(back.decode().is_err());
    }

    #[test]
    fn should_serialize_envelope_in_camel_case() {
        let event = Event::new("pa.request.created", "PA-1", json!({}))
            .with_idempotency_key("key-1")
            .with_actor(Actor {
                id: "user-1".to_owned(),
                kind: ActorKind::User,
                roles: vec!["provider".to_owned()],
            });

        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "pa.request.created");
        assert_eq!(value["subjectId"], "PA-1");
        assert_eq!(value["idempotencyKey"], "key-1");
        assert_eq!(value["actor"]["kind"], "user");
        assert!(value["producedAt"].as_str().unwrap().ends_with('Z'));
    }
}
