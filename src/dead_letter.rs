// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead Letter Handler
//!
//! Final resting place of events that will not be retried: exhausted retry
//! tickets and non-retryable handler failures. Records live in their own
//! table, apart from the ledger, and are unique per idempotency key so a
//! racing second writer is a no-op.

use crate::{
    errors::StoreError,
    event::Event,
    retry::{Clock, SystemClock},
    store::{DeadLetterRecord, RetryStore, RetryTicket},
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How hard the handler tries to persist a dead letter before giving up.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterPolicy {
    pub attempts: u32,
    /// Fixed pause between two attempts
    pub backoff: Duration,
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        DeadLetterPolicy {
            attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

pub struct DeadLetterHandler {
    store: Arc<dyn RetryStore>,
    policy: DeadLetterPolicy,
    clock: Arc<dyn Clock>,
}

impl DeadLetterHandler {
    pub fn new(store: Arc<dyn RetryStore>, policy: DeadLetterPolicy) -> DeadLetterHandler {
        DeadLetterHandler {
            store,
            policy,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persists `event` as a dead letter.
    ///
    /// `ticket` is the exhausted ledger entry when there is one; events that
    /// failed without ever being scheduled are recorded as a single attempt.
    /// A record that already exists for the same key counts as success.
    pub async fn handle(
        &self,
        event: &Event,
        ticket: Option<&RetryTicket>,
        reason: &str,
    ) -> Result<(), StoreError> {
        let record = DeadLetterRecord {
            id: Uuid::new_v4(),
            idempotency_key: event.idempotency_key.clone(),
            event: event.clone(),
            ticket_id: ticket.map(|t| t.id),
            attempt_count: ticket.map(|t| t.attempt_count).unwrap_or(1),
            last_error: ticket
                .map(|t| t.last_error.clone())
                .unwrap_or_else(|| reason.to_owned()),
            reason: reason.to_owned(),
            dead_lettered_at: self.clock.now(),
        };

        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.store.insert_dead_letter(&record).await {
                Ok(()) => {
                    info!(
                        idempotency_key = %record.idempotency_key,
                        event_type = %event.event_type,
                        attempts = record.attempt_count,
                        reason,
                        "event dead-lettered"
                    );
                    return Ok(());
                }
                Err(StoreError::ConstraintViolation(_)) => {
                    debug!(idempotency_key = %record.idempotency_key, "event already dead-lettered");
                    return Ok(());
                }
                Err(err @ StoreError::InvalidRecord(_)) => {
                    error!(error = err.to_string(), "dead letter rejected by the store");
                    return Err(err);
                }
                Err(err) if attempt < attempts => {
                    warn!(
                        error = err.to_string(),
                        attempt,
                        "failure to store dead letter, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.policy.backoff).await;
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        idempotency_key = %record.idempotency_key,
                        event_type = %event.event_type,
                        fatal = true,
                        "dead letter lost, store unavailable after {} attempts",
                        attempts
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Most recent dead letters first.
    pub async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, StoreError> {
        self.store.list_dead_letters(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, MockRetryStore};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> DeadLetterPolicy {
        DeadLetterPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    fn event() -> Event {
        Event::new("pa.request.submitted", "req-1", json!({ "status": "submitted" }))
    }

    #[tokio::test]
    async fn should_record_direct_failure_as_single_attempt() {
        let store = Arc::new(InMemoryStore::new());
        let handler = DeadLetterHandler::new(store.clone(), fast_policy());

        handler.handle(&event(), None, "schema mismatch").await.unwrap();

        let records = handler.list(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempt_count, 1);
        assert_eq!(records[0].ticket_id, None);
        assert_eq!(records[0].last_error, "schema mismatch");
    }

    #[tokio::test]
    async fn should_copy_ticket_details() {
        let store = Arc::new(InMemoryStore::new());
        let handler = DeadLetterHandler::new(store.clone(), fast_policy());
        let mut ticket = RetryTicket::first_failure(event(), 3, Utc::now(), "timeout", Utc::now());
        ticket.attempt_count = 3;

        handler
            .handle(&ticket.event, Some(&ticket), "max attempts reached")
            .await
            .unwrap();

        let records = handler.list(10).await.unwrap();
        assert_eq!(records[0].ticket_id, Some(ticket.id));
        assert_eq!(records[0].attempt_count, 3);
        assert_eq!(records[0].last_error, "timeout");
        assert_eq!(records[0].reason, "max attempts reached");
    }

    #[tokio::test]
    async fn should_treat_duplicate_as_success() {
        let store = Arc::new(InMemoryStore::new());
        let handler = DeadLetterHandler::new(store.clone(), fast_policy());

        handler.handle(&event(), None, "first").await.unwrap();
        handler.handle(&event(), None, "second").await.unwrap();

        assert_eq!(handler.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn should_retry_store_outage_with_fixed_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut store = MockRetryStore::new();
        store.expect_insert_dead_letter().times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Unreachable("connection refused".to_owned()))
            } else {
                Ok(())
            }
        });

        let handler = DeadLetterHandler::new(Arc::new(store), fast_policy());
        handler.handle(&event(), None, "fatal").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn should_give_up_after_configured_attempts() {
        let mut store = MockRetryStore::new();
        store
            .expect_insert_dead_letter()
            .times(3)
            .returning(|_| Err(StoreError::Unreachable("connection refused".to_owned())));

        let handler = DeadLetterHandler::new(Arc::new(store), fast_policy());
        let err = handler.handle(&event(), None, "fatal").await.unwrap_err();

        assert!(matches!(err, StoreError::Unreachable(_)));
    }
}
