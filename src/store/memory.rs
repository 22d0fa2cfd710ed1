// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-process store with the same constraints as the PostgreSQL schema:
//! one active ticket per source event and one dead letter per idempotency
//! key. Outages can be simulated with [`InMemoryStore::set_reachable`].

use super::{
    DeadLetterRecord, OutboxRecord, OutboxStore, RetryStore, RetryTicket, TicketStatus,
};
use crate::{errors::StoreError, event::Event};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};
use uuid::Uuid;

#[derive(Default)]
struct State {
    tickets: HashMap<Uuid, RetryTicket>,
    dead_letters: Vec<DeadLetterRecord>,
    outbox: Vec<OutboxRecord>,
    unreachable: bool,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> InMemoryStore {
        InMemoryStore::default()
    }

    /// Simulates losing (or regaining) the database.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Every ticket ever written, in no particular order.
    pub fn tickets(&self) -> Vec<RetryTicket> {
        self.lock().tickets.values().cloned().collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.lock().dead_letters.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        let state = self.lock();
        if state.unreachable {
            return Err(StoreError::Unreachable("database unavailable".to_owned()));
        }
        Ok(state)
    }
}

#[async_trait]
impl RetryStore for InMemoryStore {
    async fn insert_ticket(&self, ticket: &RetryTicket) -> Result<(), StoreError> {
        let mut state = self.open()?;

        let duplicate = state
            .tickets
            .values()
            .any(|t| t.status.is_active() && t.source_event_id == ticket.source_event_id);
        if duplicate && ticket.status.is_active() {
            return Err(StoreError::ConstraintViolation(format!(
                "active ticket exists for `{}`",
                ticket.source_event_id
            )));
        }
        if state.tickets.contains_key(&ticket.id) {
            return Err(StoreError::ConstraintViolation(format!(
                "ticket {} exists",
                ticket.id
            )));
        }

        state.tickets.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn find_active_ticket(&self, source_event_id: &str) -> Result<Option<RetryTicket>, StoreError> {
        let state = self.open()?;
        Ok(state
            .tickets
            .values()
            .find(|t| t.status.is_active() && t.source_event_id == source_event_id)
            .cloned())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<RetryTicket>, StoreError> {
        Ok(self.open()?.tickets.get(&id).cloned())
    }

    async fn update_ticket_status(
        &self,
        id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.open()?;
        match state.tickets.get_mut(&id) {
            Some(ticket) if ticket.status == from => {
                ticket.status = to;
                ticket.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reschedule_ticket(
        &self,
        id: Uuid,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.open()?;
        match state.tickets.get_mut(&id) {
            Some(ticket) if ticket.status == TicketStatus::Processing => {
                ticket.status = TicketStatus::Pending;
                ticket.attempt_count = attempt_count;
                ticket.next_attempt_at = next_attempt_at;
                ticket.last_error = last_error.to_owned();
                ticket.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_ticket(
        &self,
        observed: &RetryTicket,
        attempt_count: u32,
        lease_until: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.open()?;
        match state.tickets.get_mut(&observed.id) {
            Some(ticket)
                if ticket.status == observed.status
                    && ticket.status.is_active()
                    && ticket.attempt_count == observed.attempt_count
                    && ticket.next_attempt_at == observed.next_attempt_at =>
            {
                ticket.status = TicketStatus::Processing;
                ticket.attempt_count = attempt_count;
                ticket.next_attempt_at = lease_until;
                ticket.last_error = last_error.to_owned();
                ticket.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn query_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryTicket>, StoreError> {
        let state = self.open()?;
        let mut due: Vec<RetryTicket> = state
            .tickets
            .values()
            .filter(|t| t.status.is_active() && t.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_attempt_at
                .cmp(&b.next_attempt_at)
                .then(a.created_at.cmp(&b.created_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), StoreError> {
        let mut state = self.open()?;
        if state
            .dead_letters
            .iter()
            .any(|r| r.idempotency_key == record.idempotency_key)
        {
            return Err(StoreError::ConstraintViolation(format!(
                "dead letter exists for `{}`",
                record.idempotency_key
            )));
        }
        state.dead_letters.push(record.clone());
        Ok(())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let state = self.open()?;
        let mut records = state.dead_letters.clone();
        records.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.open()?;
        let before = state.tickets.len();
        state
            .tickets
            .retain(|_, t| !(t.status == TicketStatus::Completed && t.updated_at < older_than));
        Ok((before - state.tickets.len()) as u64)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn insert_outbox(&self, event: &Event) -> Result<OutboxRecord, StoreError> {
        let mut state = self.open()?;
        let record = OutboxRecord {
            id: Uuid::new_v4(),
            event: event.clone(),
            created_at: Utc::now(),
            published_at: None,
        };
        state.outbox.push(record.clone());
        Ok(record)
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let state = self.open()?;
        Ok(state
            .outbox
            .iter()
            .filter(|r| r.published_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_outbox_published(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.open()?;
        match state.outbox.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.published_at = Some(at);
                Ok(())
            }
            None => Err(StoreError::InvalidRecord(format!("no outbox row {}", id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn ticket(subject: &str, next_attempt_at: DateTime<Utc>) -> RetryTicket {
        let event = Event::new("pa.request.submitted", subject, json!({ "n": subject }));
        RetryTicket::first_failure(event, 3, next_attempt_at, "timeout", Utc::now())
    }

    #[tokio::test]
    async fn should_reject_second_active_ticket_for_same_event() {
        let store = InMemoryStore::new();
        let first = ticket("req-1", Utc::now());
        store.insert_ticket(&first).await.unwrap();

        let mut second = first.clone();
        second.id = Uuid::new_v4();
        let err = store.insert_ticket(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));

        store
            .update_ticket_status(first.id, TicketStatus::Pending, TicketStatus::Completed)
            .await
            .unwrap();
        store.insert_ticket(&second).await.unwrap();
    }

    #[tokio::test]
    async fn should_only_transition_from_expected_status() {
        let store = InMemoryStore::new();
        let t = ticket("req-1", Utc::now());
        store.insert_ticket(&t).await.unwrap();

        assert!(store
            .update_ticket_status(t.id, TicketStatus::Pending, TicketStatus::Processing)
            .await
            .unwrap());
        assert!(!store
            .update_ticket_status(t.id, TicketStatus::Pending, TicketStatus::Processing)
            .await
            .unwrap());
        assert!(!store
            .reschedule_ticket(Uuid::new_v4(), 2, Utc::now(), "boom")
            .await
            .unwrap());
        assert!(store.reschedule_ticket(t.id, 2, Utc::now(), "boom").await.unwrap());

        let stored = store.get_ticket(t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::Pending);
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.last_error, "boom");
    }

    #[tokio::test]
    async fn should_return_due_tickets_in_schedule_order() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let late = ticket("late", now - Duration::seconds(1));
        let early = ticket("early", now - Duration::seconds(10));
        let future = ticket("future", now + Duration::seconds(10));
        for t in [&late, &early, &future] {
            store.insert_ticket(t).await.unwrap();
        }

        let due = store.query_due(now, 10).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);

        assert_eq!(store.query_due(now, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn should_claim_only_unchanged_tickets() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let t = ticket("req-1", now);
        store.insert_ticket(&t).await.unwrap();
        let lease_until = now + Duration::minutes(5);

        assert!(store.claim_ticket(&t, 1, lease_until, "timeout").await.unwrap());
        assert!(!store.claim_ticket(&t, 1, lease_until, "timeout").await.unwrap());

        let claimed = store.get_ticket(t.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, TicketStatus::Processing);
        assert_eq!(claimed.next_attempt_at, lease_until);

        assert!(store
            .claim_ticket(&claimed, 2, lease_until + Duration::minutes(5), "lease expired")
            .await
            .unwrap());
        let reclaimed = store.get_ticket(t.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.attempt_count, 2);
        assert_eq!(reclaimed.last_error, "lease expired");
    }

    #[tokio::test]
    async fn should_return_processing_tickets_once_lease_ran_out() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let t = ticket("req-1", now);
        store.insert_ticket(&t).await.unwrap();
        store
            .claim_ticket(&t, 1, now + Duration::minutes(5), "timeout")
            .await
            .unwrap();

        assert!(store.query_due(now, 10).await.unwrap().is_empty());
        let due = store.query_due(now + Duration::minutes(5), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].status, TicketStatus::Processing);
    }

    #[tokio::test]
    async fn should_purge_only_old_completed_tickets() {
        let store = InMemoryStore::new();
        let done = ticket("done", Utc::now());
        let open = ticket("open", Utc::now());
        store.insert_ticket(&done).await.unwrap();
        store.insert_ticket(&open).await.unwrap();
        store
            .update_ticket_status(done.id, TicketStatus::Pending, TicketStatus::Completed)
            .await
            .unwrap();

        let purged = store
            .purge_completed(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert_eq!(store.tickets().len(), 1);
    }

    #[tokio::test]
    async fn should_fail_every_call_while_unreachable() {
        let store = InMemoryStore::new();
        store.set_reachable(false);

        let err = store.find_active_ticket("key").await.unwrap_err();
        assert!(matches!(err, StoreError::Unreachable(_)));

        store.set_reachable(true);
        assert!(store.find_active_ticket("key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn should_mark_outbox_rows_published() {
        let store = InMemoryStore::new();
        let event = Event::new("pa.request.created", "req-1", json!({}));
        let row = store.insert_outbox(&event).await.unwrap();

        assert_eq!(store.pending_outbox(10).await.unwrap().len(), 1);
        store.mark_outbox_published(row.id, Utc::now()).await.unwrap();
        assert!(store.pending_outbox(10).await.unwrap().is_empty());
    }
}
