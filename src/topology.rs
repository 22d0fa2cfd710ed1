// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Topology Definitions
//!
//! This module describes the topology the backbone needs on the broker: one
//! durable topic exchange, a set of durable queues bounded by length and
//! per-message TTL, and the static bindings between them. The definitions are
//! plain data; broker adapters turn them into declarations.
//!
//! Routing keys follow AMQP topic semantics: words separated by `.`, where a
//! `*` in a binding pattern matches exactly one word and `#` matches zero or
//! more words.

use std::collections::BTreeMap;

/// Default per-message TTL of the live queues (24 hours)
pub const DEFAULT_MESSAGE_TTL_MS: i32 = 86_400_000;
/// Default maximum number of messages held by a live queue
pub const DEFAULT_MAX_LENGTH: i32 = 10_000;

/// Definition of the topic exchange events are published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a non-durable topic exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Definition of a queue with its configuration parameters.
///
/// Two definitions with the same name are compatible only when every
/// parameter matches; brokers reject a re-declaration that differs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default the queue is not durable and carries no TTL or length bound.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            ttl: None,
            max_length: None,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    ///
    /// Messages that exceed this TTL are removed from the live queue; from
    /// then on only the retry ledger can bring them back.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}

/// Queue arguments applied to every queue of a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub message_ttl_ms: Option<i32>,
    pub max_length: Option<i32>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            message_ttl_ms: Some(DEFAULT_MESSAGE_TTL_MS),
            max_length: Some(DEFAULT_MAX_LENGTH),
        }
    }
}

/// Static mapping of a queue to a routing key pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicBinding {
    pub queue_name: String,
    pub routing_key_pattern: String,
}

impl TopicBinding {
    pub fn new(queue_name: &str, routing_key_pattern: &str) -> TopicBinding {
        TopicBinding {
            queue_name: queue_name.to_owned(),
            routing_key_pattern: routing_key_pattern.to_owned(),
        }
    }

    /// Returns true when `routing_key` is delivered to this binding's queue.
    pub fn matches(&self, routing_key: &str) -> bool {
        topic_matches(&self.routing_key_pattern, routing_key)
    }
}

/// Matches a routing key against a topic binding pattern.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

/// Routing keys of the prior-authorization workflow paired with the queue
/// suffix that receives them.
pub const WORKFLOW_ROUTES: [(&str, &str); 9] = [
    ("pa_request_created", "pa.request.created"),
    ("pa_request_submitted", "pa.request.submitted"),
    ("pa_request_updated", "pa.request.updated"),
    ("pa_response_received", "pa.response.received"),
    ("pa_validation_required", "pa.validation.required"),
    ("pa_workflow_triggered", "pa.workflow.triggered"),
    ("pa_notification_required", "pa.notification.required"),
    ("pa_audit_event", "pa.audit.event"),
    ("pa_error_occurred", "pa.error.occurred"),
];

/// Builds the default bindings of the workflow, one queue per event type,
/// each queue named `{prefix}_{suffix}`.
pub fn workflow_bindings(prefix: &str) -> Vec<TopicBinding> {
    WORKFLOW_ROUTES
        .iter()
        .map(|(suffix, key)| TopicBinding::new(&format!("{}_{}", prefix, suffix), key))
        .collect()
}

/// Complete set of declarations derived from the static bindings.
#[derive(Debug, Clone)]
pub struct Topology {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) queues: BTreeMap<String, QueueDefinition>,
    pub(crate) bindings: Vec<TopicBinding>,
}

impl Topology {
    /// Derives a topology from bindings: a durable topic exchange and one
    /// durable queue, configured with `settings`, per distinct queue name.
    pub fn build(exchange: &str, settings: QueueSettings, bindings: &[TopicBinding]) -> Topology {
        let mut queues = BTreeMap::new();

        for binding in bindings {
            queues
                .entry(binding.queue_name.clone())
                .or_insert_with(|| queue_definition(&binding.queue_name, settings));
        }

        let mut unique = Vec::with_capacity(bindings.len());
        for binding in bindings {
            if !unique.contains(binding) {
                unique.push(binding.clone());
            }
        }

        Topology {
            exchange: ExchangeDefinition::new(exchange).durable(),
            queues,
            bindings: unique,
        }
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueDefinition> {
        self.queues.values()
    }

    pub fn bindings(&self) -> &[TopicBinding] {
        &self.bindings
    }

    /// Names of the queues that receive a copy of a message published with
    /// `routing_key`, without duplicates.
    pub fn route(&self, routing_key: &str) -> Vec<&str> {
        let mut queues: Vec<&str> = vec![];
        for binding in self.bindings.iter().filter(|b| b.matches(routing_key)) {
            if !queues.contains(&binding.queue_name.as_str()) {
                queues.push(&binding.queue_name);
            }
        }
        queues
    }
}

fn queue_definition(name: &str, settings: QueueSettings) -> QueueDefinition {
    let mut def = QueueDefinition::new(name).durable();
    if let Some(ttl) = settings.message_ttl_ms {
        def = def.ttl(ttl);
    }
    if let Some(max) = settings.max_length {
        def = def.max_length(max);
    }
    def
}
