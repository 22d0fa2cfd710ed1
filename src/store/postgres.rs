// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! PostgreSQL implementation of the ledger, dead letter and outbox stores.
//!
//! The partial unique index `retry_tickets_active_source` enforces one
//! pending or processing ticket per source event; every status change is an
//! `UPDATE ... WHERE status = $from` so the row itself arbitrates races.
//! Claims additionally match the attempt count and schedule that were read,
//! which keeps two sweepers from both reclaiming an expired lease.

use super::{
    DeadLetterRecord, OutboxRecord, OutboxStore, RetryStore, RetryTicket, TicketStatus,
};
use crate::{errors::StoreError, event::Event};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    types::Json,
    PgPool, Postgres, Row, Transaction,
};
use tracing::{debug, error};
use uuid::Uuid;

const MAX_CONNECTIONS: u32 = 10;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS retry_tickets (
    id UUID PRIMARY KEY,
    source_event_id TEXT NOT NULL,
    event JSONB NOT NULL,
    attempt_count INTEGER NOT NULL CHECK (attempt_count >= 1),
    max_attempts INTEGER NOT NULL CHECK (max_attempts >= 1),
    next_attempt_at TIMESTAMPTZ NOT NULL,
    last_error TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'exhausted', 'completed')),
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS retry_tickets_active_source
    ON retry_tickets (source_event_id) WHERE status IN ('pending', 'processing');
CREATE INDEX IF NOT EXISTS retry_tickets_schedule
    ON retry_tickets (next_attempt_at) WHERE status IN ('pending', 'processing');
CREATE TABLE IF NOT EXISTS dead_letters (
    id UUID PRIMARY KEY,
    idempotency_key TEXT NOT NULL UNIQUE,
    event JSONB NOT NULL,
    ticket_id UUID,
    attempt_count INTEGER NOT NULL,
    last_error TEXT NOT NULL,
    reason TEXT NOT NULL,
    dead_lettered_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS event_outbox (
    id UUID PRIMARY KEY,
    event JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    published_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS event_outbox_pending
    ON event_outbox (created_at) WHERE published_at IS NULL;
";

/// Column list for `retry_tickets` queries.
const TICKET_COLUMNS: &str = "\
    id, source_event_id, event, attempt_count, max_attempts, \
    next_attempt_at, last_error, status, created_at, updated_at";

/// Column list for `dead_letters` queries.
const DEAD_LETTER_COLUMNS: &str = "\
    id, idempotency_key, event, ticket_id, attempt_count, \
    last_error, reason, dead_lettered_at";

const OUTBOX_COLUMNS: &str = "id, event, created_at, published_at";

/// Maps a sqlx error onto the store error taxonomy.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("23505") | Some("23503") | Some("23514") => {
                StoreError::ConstraintViolation(db_err.to_string())
            }
            Some("40001") | Some("40P01") => StoreError::ConcurrencyConflict(db_err.to_string()),
            _ => StoreError::Unreachable(err.to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unreachable(err.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::InvalidRecord(err.to_string())
        }
        _ => StoreError::Unreachable(err.to_string()),
    }
}

fn to_i32(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::InvalidRecord(format!("`{}` out of range: {}", column, value)))
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::InvalidRecord(format!("`{}` out of range: {}", column, value)))
}

fn ticket_from_row(row: &PgRow) -> Result<RetryTicket, StoreError> {
    let Json(event): Json<Event> = row.try_get("event").map_err(map_sqlx_error)?;
    let status: String = row.try_get("status").map_err(map_sqlx_error)?;

    Ok(RetryTicket {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        source_event_id: row.try_get("source_event_id").map_err(map_sqlx_error)?,
        event,
        attempt_count: to_u32(row.try_get("attempt_count").map_err(map_sqlx_error)?, "attempt_count")?,
        max_attempts: to_u32(row.try_get("max_attempts").map_err(map_sqlx_error)?, "max_attempts")?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(map_sqlx_error)?,
        last_error: row.try_get("last_error").map_err(map_sqlx_error)?,
        status: TicketStatus::parse(&status)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_error)?,
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterRecord, StoreError> {
    let Json(event): Json<Event> = row.try_get("event").map_err(map_sqlx_error)?;

    Ok(DeadLetterRecord {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        idempotency_key: row.try_get("idempotency_key").map_err(map_sqlx_error)?,
        event,
        ticket_id: row.try_get("ticket_id").map_err(map_sqlx_error)?,
        attempt_count: to_u32(row.try_get("attempt_count").map_err(map_sqlx_error)?, "attempt_count")?,
        last_error: row.try_get("last_error").map_err(map_sqlx_error)?,
        reason: row.try_get("reason").map_err(map_sqlx_error)?,
        dead_lettered_at: row.try_get("dead_lettered_at").map_err(map_sqlx_error)?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxRecord, StoreError> {
    let Json(event): Json<Event> = row.try_get("event").map_err(map_sqlx_error)?;

    Ok(OutboxRecord {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        event,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        published_at: row.try_get("published_at").map_err(map_sqlx_error)?,
    })
}

/// Durable store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> PostgresStore {
        PostgresStore { pool }
    }

    /// Opens a connection pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<PostgresStore, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(database_url)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect to the database");
                map_sqlx_error(err)
            })?;

        debug!("database pool created");
        Ok(PostgresStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the tables and indexes when they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to migrate the schema");
                map_sqlx_error(err)
            })?;

        debug!("schema migrated");
        Ok(())
    }

    /// Stages `event` for publication inside the caller's transaction, so it
    /// is committed or rolled back together with the business write.
    pub async fn stage_outbox(
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO event_outbox (id, event, created_at) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(Json(event))
            .bind(Utc::now())
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(id)
    }
}

#[async_trait]
impl RetryStore for PostgresStore {
    async fn insert_ticket(&self, ticket: &RetryTicket) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO retry_tickets \
             (id, source_event_id, event, attempt_count, max_attempts, next_attempt_at, \
              last_error, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(ticket.id)
        .bind(&ticket.source_event_id)
        .bind(Json(&ticket.event))
        .bind(to_i32(ticket.attempt_count, "attempt_count")?)
        .bind(to_i32(ticket.max_attempts, "max_attempts")?)
        .bind(ticket.next_attempt_at)
        .bind(&ticket.last_error)
        .bind(ticket.status.as_str())
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn find_active_ticket(&self, source_event_id: &str) -> Result<Option<RetryTicket>, StoreError> {
        let query = format!(
            "SELECT {TICKET_COLUMNS} FROM retry_tickets \
             WHERE source_event_id = $1 AND status IN ('pending', 'processing')"
        );
        sqlx::query(&query)
            .bind(source_event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .as_ref()
            .map(ticket_from_row)
            .transpose()
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<RetryTicket>, StoreError> {
        let query = format!("SELECT {TICKET_COLUMNS} FROM retry_tickets WHERE id = $1");
        sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .as_ref()
            .map(ticket_from_row)
            .transpose()
    }

    async fn update_ticket_status(
        &self,
        id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE retry_tickets SET status = $3, updated_at = NOW() \
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn reschedule_ticket(
        &self,
        id: Uuid,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE retry_tickets \
             SET status = 'pending', attempt_count = $2, next_attempt_at = $3, \
                 last_error = $4, updated_at = NOW() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(to_i32(attempt_count, "attempt_count")?)
        .bind(next_attempt_at)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_ticket(
        &self,
        observed: &RetryTicket,
        attempt_count: u32,
        lease_until: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE retry_tickets \
             SET status = 'processing', attempt_count = $5, next_attempt_at = $6, \
                 last_error = $7, updated_at = NOW() \
             WHERE id = $1 AND status = $2 AND attempt_count = $3 AND next_attempt_at = $4 \
               AND status IN ('pending', 'processing')",
        )
        .bind(observed.id)
        .bind(observed.status.as_str())
        .bind(to_i32(observed.attempt_count, "attempt_count")?)
        .bind(observed.next_attempt_at)
        .bind(to_i32(attempt_count, "attempt_count")?)
        .bind(lease_until)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn query_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RetryTicket>, StoreError> {
        let query = format!(
            "SELECT {TICKET_COLUMNS} FROM retry_tickets \
             WHERE status IN ('pending', 'processing') AND next_attempt_at <= $1 \
             ORDER BY next_attempt_at ASC, created_at ASC \
             LIMIT $2"
        );
        sqlx::query(&query)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .iter()
            .map(ticket_from_row)
            .collect()
    }

    async fn insert_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO dead_letters \
             (id, idempotency_key, event, ticket_id, attempt_count, last_error, reason, dead_lettered_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.id)
        .bind(&record.idempotency_key)
        .bind(Json(&record.event))
        .bind(record.ticket_id)
        .bind(to_i32(record.attempt_count, "attempt_count")?)
        .bind(&record.last_error)
        .bind(&record.reason)
        .bind(record.dead_lettered_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let query = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters \
             ORDER BY dead_lettered_at DESC LIMIT $1"
        );
        sqlx::query(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .iter()
            .map(dead_letter_from_row)
            .collect()
    }

    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM retry_tickets WHERE status = 'completed' AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OutboxStore for PostgresStore {
    async fn insert_outbox(&self, event: &Event) -> Result<OutboxRecord, StoreError> {
        let query = format!(
            "INSERT INTO event_outbox (id, event, created_at) VALUES ($1, $2, $3) \
             RETURNING {OUTBOX_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(Json(event))
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        outbox_from_row(&row)
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let query = format!(
            "SELECT {OUTBOX_COLUMNS} FROM event_outbox \
             WHERE published_at IS NULL ORDER BY created_at ASC LIMIT $1"
        );
        sqlx::query(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .iter()
            .map(outbox_from_row)
            .collect()
    }

    async fn mark_outbox_published(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE event_outbox SET published_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}
