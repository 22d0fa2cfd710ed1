// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Durable Store
//!
//! Persistence for the retry ledger, the dead letter table and the
//! transactional outbox. Every ticket transition is a conditional update
//! keyed on the current status, so concurrent sweepers and consumers never
//! overwrite each other: the loser simply sees `false`.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

use crate::{errors::StoreError, event::Event};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a retry ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TicketStatus {
    Pending,
    Processing,
    Exhausted,
    Completed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::Processing => "processing",
            TicketStatus::Exhausted => "exhausted",
            TicketStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Result<TicketStatus, StoreError> {
        match value {
            "pending" => Ok(TicketStatus::Pending),
            "processing" => Ok(TicketStatus::Processing),
            "exhausted" => Ok(TicketStatus::Exhausted),
            "completed" => Ok(TicketStatus::Completed),
            other => Err(StoreError::InvalidRecord(format!(
                "unknown ticket status `{}`",
                other
            ))),
        }
    }

    /// Active tickets still own the redelivery of their event.
    pub fn is_active(&self) -> bool {
        matches!(self, TicketStatus::Pending | TicketStatus::Processing)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the retry ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryTicket {
    pub id: Uuid,
    /// Idempotency key of the event being retried
    pub source_event_id: String,
    pub event: Event,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Due time while pending, lease end while processing
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: String,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryTicket {
    /// A new pending ticket for the first recorded failure of `event`.
    pub fn first_failure(
        event: Event,
        max_attempts: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> RetryTicket {
        RetryTicket {
            id: Uuid::new_v4(),
            source_event_id: event.idempotency_key.clone(),
            event,
            attempt_count: 1,
            max_attempts,
            next_attempt_at,
            last_error: last_error.to_owned(),
            status: TicketStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// An event that will not be retried any further.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub idempotency_key: String,
    pub event: Event,
    pub ticket_id: Option<Uuid>,
    pub attempt_count: u32,
    pub last_error: String,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// An event staged for publication.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub event: Event,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Storage of the retry ledger and the dead letter table.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Inserts a new ticket.
    ///
    /// Fails with [`StoreError::ConstraintViolation`] when an active ticket
    /// already exists for the same source event.
    async fn insert_ticket(&self, ticket: &RetryTicket) -> Result<(), StoreError>;

    /// The pending or processing ticket of `source_event_id`, if any.
    async fn find_active_ticket(&self, source_event_id: &str) -> Result<Option<RetryTicket>, StoreError>;

    async fn get_ticket(&self, id: Uuid) -> Result<Option<RetryTicket>, StoreError>;

    /// Moves the ticket from `from` to `to`; `false` when its status was not
    /// `from` anymore.
    async fn update_ticket_status(
        &self,
        id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
    ) -> Result<bool, StoreError>;

    /// Records a failed redelivery: `processing -> pending` with the new
    /// attempt count, schedule and error. `false` when the ticket was not
    /// processing.
    async fn reschedule_ticket(
        &self,
        id: Uuid,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, StoreError>;

    /// Claims a due ticket for one redelivery: it becomes `processing` with
    /// `attempt_count` and `last_error`, and its `next_attempt_at` holds the
    /// lease end `lease_until`. Applies only while the stored status,
    /// attempt count and schedule still equal those of `observed`; `false`
    /// otherwise.
    async fn claim_ticket(
        &self,
        observed: &RetryTicket,
        attempt_count: u32,
        lease_until: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, StoreError>;

    /// Tickets due at `now`, oldest schedule first: pending tickets whose
    /// attempt is due and processing tickets whose lease has run out.
    async fn query_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryTicket>, StoreError>;

    /// Fails with [`StoreError::ConstraintViolation`] when a record with the
    /// same idempotency key exists.
    async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), StoreError>;

    /// Dead letters, newest first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, StoreError>;

    /// Deletes completed tickets last updated before `older_than`.
    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Storage of the transactional outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn insert_outbox(&self, event: &Event) -> Result<OutboxRecord, StoreError>;

    /// Unpublished rows, oldest first.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError>;

    async fn mark_outbox_published(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn should_round_trip_status_names() {
        for status in [
            TicketStatus::Pending,
            TicketStatus::Processing,
            TicketStatus::Exhausted,
            TicketStatus::Completed,
        ] {
            assert_eq!(TicketStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(matches!(
            TicketStatus::parse("archived"),
            Err(StoreError::InvalidRecord(_))
        ));
    }

    #[test]
    fn should_start_tickets_at_first_attempt() {
        let event = Event::new("pa.request.submitted", "req-1", json!({}));
        let now = Utc::now();
        let ticket = RetryTicket::first_failure(event.clone(), 3, now, "timeout", now);

        assert_eq!(ticket.source_event_id, event.idempotency_key);
        assert_eq!(ticket.attempt_count, 1);
        assert_eq!(ticket.status, TicketStatus::Pending);
        assert!(!ticket.is_exhausted());
    }
}
