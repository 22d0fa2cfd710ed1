// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Scheduler
//!
//! The retry ledger is the source of truth for redelivery. A consumer that
//! gives up on a message records the failure here and discards the message;
//! the scheduler's sweep later claims due tickets one by one and republishes
//! their events with the original idempotency key, or dead-letters them once
//! `max_attempts` deliveries have failed.
//!
//! Claims are compare-and-set transitions `pending -> processing`, so several
//! sweepers may run against the same ledger and each ticket is republished by
//! exactly one of them.
//!
//! A claim holds the ticket for `claim_lease`. The republished copy is
//! expected to come back through a consumer before the lease ends, which
//! completes or reschedules the ticket. When the copy never comes back
//! (dropped at the queue's length bound, expired by its TTL, lost with a
//! node), the sweep reclaims the ticket and counts the lost copy as a failed
//! attempt, so the event is either redelivered or dead-lettered.

use crate::{
    dead_letter::DeadLetterHandler,
    errors::StoreError,
    event::Event,
    publisher::EventPublisher,
    store::{RetryStore, RetryTicket, TicketStatus},
};
use chrono::{DateTime, Utc};
use futures_util::{
    stream::{self, BoxStream},
    StreamExt,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Recorded on a ticket reclaimed after its lease ran out
const LEASE_EXPIRED: &str = "republished event not settled before the claim lease ran out";

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> ManualClock {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = after(*now, by);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exponential backoff applied between redeliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Deliveries allowed before an event is dead-lettered, at least 1
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(3_600),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `prior_attempts` earlier failures:
    /// `initial_delay * backoff_multiplier ^ prior_attempts`, capped at
    /// `max_delay`.
    pub fn delay_for(&self, prior_attempts: u32) -> Duration {
        let exponent = i32::try_from(prior_attempts).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(self.max_delay),
            Err(_) => self.max_delay,
        }
    }
}

/// Cadence and batch size of the sweep loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub sweep_interval: Duration,
    pub batch_size: usize,
    /// Completed tickets older than this are purged from the ledger
    pub completed_retention: Duration,
    /// How long a republished event may stay unsettled before its ticket is
    /// reclaimed
    pub claim_lease: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            sweep_interval: Duration::from_secs(30),
            batch_size: 100,
            completed_retention: Duration::from_secs(24 * 3_600),
            claim_lease: Duration::from_secs(300),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub republished: usize,
    pub exhausted: usize,
    pub released: usize,
}

enum Due {
    Query,
    Claim(std::vec::IntoIter<RetryTicket>),
    Done,
}

pub struct RetryScheduler {
    store: Arc<dyn RetryStore>,
    publisher: Arc<EventPublisher>,
    dead_letter: Arc<DeadLetterHandler>,
    policy: RetryPolicy,
    settings: SchedulerSettings,
    clock: Arc<dyn Clock>,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn RetryStore>,
        publisher: Arc<EventPublisher>,
        dead_letter: Arc<DeadLetterHandler>,
        policy: RetryPolicy,
    ) -> RetryScheduler {
        RetryScheduler {
            store,
            publisher,
            dead_letter,
            policy,
            settings: SchedulerSettings::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn dead_letter(&self) -> &DeadLetterHandler {
        &self.dead_letter
    }

    /// The pending or processing ticket of an idempotency key.
    pub async fn active_ticket(&self, idempotency_key: &str) -> Result<Option<RetryTicket>, StoreError> {
        self.store.find_active_ticket(idempotency_key).await
    }

    /// Records a failed delivery of `event`.
    ///
    /// The first failure creates a pending ticket at attempt 1. A failure of
    /// a redelivery (the ticket is processing) advances the attempt count
    /// and reschedules it. A ticket that is already pending is returned
    /// unchanged.
    pub async fn record_failure(&self, event: &Event, error: &str) -> Result<RetryTicket, StoreError> {
        let key = &event.idempotency_key;

        match self.store.find_active_ticket(key).await? {
            None => self.open_ticket(event, error).await,
            Some(ticket) if ticket.status == TicketStatus::Pending => {
                debug!(ticket_id = %ticket.id, idempotency_key = %key, "ticket already scheduled");
                Ok(ticket)
            }
            Some(ticket) => self.advance(ticket, error).await,
        }
    }

    async fn open_ticket(&self, event: &Event, error: &str) -> Result<RetryTicket, StoreError> {
        let now = self.clock.now();
        let next_attempt_at = after(now, self.policy.delay_for(0));
        let ticket = RetryTicket::first_failure(
            event.clone(),
            self.policy.max_attempts,
            next_attempt_at,
            error,
            now,
        );

        match self.store.insert_ticket(&ticket).await {
            Ok(()) => {
                info!(
                    ticket_id = %ticket.id,
                    idempotency_key = %ticket.source_event_id,
                    next_attempt_at = %ticket.next_attempt_at,
                    "retry ticket opened"
                );
                Ok(ticket)
            }
            Err(StoreError::ConstraintViolation(_)) => {
                // lost the insert race, the winner's ticket stands
                self.store
                    .find_active_ticket(&ticket.source_event_id)
                    .await?
                    .ok_or_else(|| {
                        StoreError::ConcurrencyConflict(format!(
                            "ticket of `{}` changed while opening",
                            ticket.source_event_id
                        ))
                    })
            }
            Err(err) => Err(err),
        }
    }

    async fn advance(&self, mut ticket: RetryTicket, error: &str) -> Result<RetryTicket, StoreError> {
        let now = self.clock.now();
        let attempt_count = ticket.attempt_count.saturating_add(1);
        let next_attempt_at = after(now, self.policy.delay_for(ticket.attempt_count));

        if !self
            .store
            .reschedule_ticket(ticket.id, attempt_count, next_attempt_at, error)
            .await?
        {
            debug!(ticket_id = %ticket.id, "ticket moved concurrently, keeping stored state");
            return self.store.get_ticket(ticket.id).await?.ok_or_else(|| {
                StoreError::ConcurrencyConflict(format!("ticket {} disappeared", ticket.id))
            });
        }

        ticket.attempt_count = attempt_count;
        ticket.next_attempt_at = next_attempt_at;
        ticket.last_error = error.to_owned();
        ticket.status = TicketStatus::Pending;
        ticket.updated_at = now;

        info!(
            ticket_id = %ticket.id,
            attempt = ticket.attempt_count,
            next_attempt_at = %ticket.next_attempt_at,
            "retry ticket rescheduled"
        );
        Ok(ticket)
    }

    /// Tickets due at `now`, claimed lazily as the stream is polled.
    ///
    /// The batch is read on first poll, oldest schedule first. Each ticket is
    /// claimed right before it is yielded and leased until `now +
    /// claim_lease`. A processing ticket whose lease ran out is reclaimed
    /// with its attempt count raised by one. Tickets claimed by someone else
    /// in the meantime are skipped. Dropping the stream leaves the remaining
    /// tickets untouched.
    pub fn due_tickets(&self, now: DateTime<Utc>) -> BoxStream<'static, Result<RetryTicket, StoreError>> {
        let store = self.store.clone();
        let limit = self.settings.batch_size;
        let lease_until = after(now, self.settings.claim_lease);

        stream::unfold(Due::Query, move |state| {
            let store = store.clone();
            async move {
                let mut candidates = match state {
                    Due::Query => match store.query_due(now, limit).await {
                        Ok(tickets) => tickets.into_iter(),
                        Err(err) => return Some((Err(err), Due::Done)),
                    },
                    Due::Claim(candidates) => candidates,
                    Due::Done => return None,
                };

                while let Some(mut ticket) = candidates.next() {
                    let (attempt_count, last_error) = match ticket.status {
                        TicketStatus::Pending => (ticket.attempt_count, ticket.last_error.clone()),
                        TicketStatus::Processing => (
                            ticket.attempt_count.saturating_add(1),
                            LEASE_EXPIRED.to_owned(),
                        ),
                        _ => continue,
                    };

                    match store
                        .claim_ticket(&ticket, attempt_count, lease_until, &last_error)
                        .await
                    {
                        Ok(true) => {
                            if ticket.status == TicketStatus::Processing {
                                warn!(
                                    ticket_id = %ticket.id,
                                    idempotency_key = %ticket.source_event_id,
                                    attempt = attempt_count,
                                    "republished event not settled before its lease ran out, reclaiming"
                                );
                            }
                            ticket.status = TicketStatus::Processing;
                            ticket.attempt_count = attempt_count;
                            ticket.next_attempt_at = lease_until;
                            ticket.last_error = last_error;
                            return Some((Ok(ticket), Due::Claim(candidates)));
                        }
                        Ok(false) | Err(StoreError::ConcurrencyConflict(_)) => {
                            debug!(ticket_id = %ticket.id, "ticket claimed elsewhere, skipping");
                        }
                        Err(err) => return Some((Err(err), Due::Done)),
                    }
                }

                None
            }
        })
        .boxed()
    }

    /// Marks a ticket completed after a successful delivery.
    ///
    /// Returns `false` when the ticket was no longer active.
    pub async fn complete(&self, ticket_id: Uuid) -> Result<bool, StoreError> {
        for from in [TicketStatus::Processing, TicketStatus::Pending] {
            if self
                .store
                .update_ticket_status(ticket_id, from, TicketStatus::Completed)
                .await?
            {
                info!(ticket_id = %ticket_id, "retry ticket completed");
                return Ok(true);
            }
        }

        debug!(ticket_id = %ticket_id, "ticket no longer active, nothing to complete");
        Ok(false)
    }

    /// Dead-letters the event of a ticket, then marks the ticket exhausted.
    ///
    /// Returns `false` when the ticket was not active anymore.
    pub async fn exhaust(&self, ticket_id: Uuid, reason: &str) -> Result<bool, StoreError> {
        let Some(ticket) = self.store.get_ticket(ticket_id).await? else {
            return Err(StoreError::InvalidRecord(format!("no ticket {}", ticket_id)));
        };
        if !ticket.status.is_active() {
            return Ok(false);
        }

        self.dead_letter.handle(&ticket.event, Some(&ticket), reason).await?;

        for from in [TicketStatus::Processing, TicketStatus::Pending] {
            if self
                .store
                .update_ticket_status(ticket.id, from, TicketStatus::Exhausted)
                .await?
            {
                warn!(
                    ticket_id = %ticket.id,
                    idempotency_key = %ticket.source_event_id,
                    attempts = ticket.attempt_count,
                    reason,
                    "retry ticket exhausted"
                );
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// One pass over the due tickets: republish, or dead-letter the ones that
    /// used all their attempts.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let mut due = self.due_tickets(self.clock.now());

        while let Some(claimed) = due.next().await {
            let ticket = claimed?;
            report.claimed += 1;

            if ticket.is_exhausted() {
                match self.exhaust(ticket.id, "max attempts reached").await {
                    Ok(true) => report.exhausted += 1,
                    Ok(false) => {}
                    Err(err) => {
                        error!(error = err.to_string(), ticket_id = %ticket.id, "failure to exhaust ticket");
                        if self.release(&ticket).await? {
                            report.released += 1;
                        }
                    }
                }
                continue;
            }

            match self.publisher.send(&ticket.event).await {
                Ok(()) => {
                    debug!(
                        ticket_id = %ticket.id,
                        attempt = ticket.attempt_count + 1,
                        "event republished"
                    );
                    report.republished += 1;
                }
                Err(err) => {
                    warn!(error = err.to_string(), ticket_id = %ticket.id, "failure to republish, releasing ticket");
                    if self.release(&ticket).await? {
                        report.released += 1;
                    }
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                republished = report.republished,
                exhausted = report.exhausted,
                released = report.released,
                "retry sweep finished"
            );
        }

        Ok(report)
    }

    /// Gives a claimed ticket back as pending and due right away.
    async fn release(&self, ticket: &RetryTicket) -> Result<bool, StoreError> {
        self.store
            .reschedule_ticket(ticket.id, ticket.attempt_count, self.clock.now(), &ticket.last_error)
            .await
    }

    /// Deletes completed tickets older than the retention period.
    pub async fn purge_completed(&self) -> Result<u64, StoreError> {
        let older_than = chrono::Duration::from_std(self.settings.completed_retention)
            .ok()
            .and_then(|retention| self.clock.now().checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.store.purge_completed(older_than).await?;
        if purged > 0 {
            info!(purged, "completed tickets purged");
        }
        Ok(purged)
    }

    /// Sweeps on a fixed interval until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = ticker(self.settings.sweep_interval);

        info!(interval = ?self.settings.sweep_interval, "retry scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.sweep().await {
                        error!(error = err.to_string(), "retry sweep failed");
                    }
                    if let Err(err) = self.purge_completed().await {
                        error!(error = err.to_string(), "failure to purge completed tickets");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("retry scheduler stopped");
    }
}

/// Interval that delays missed ticks. Periods below one millisecond are
/// raised to it, `tokio::time::interval` panics on zero.
pub(crate) fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(MIN_PERIOD));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

/// `at + delay`, saturating at the largest representable instant.
fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
