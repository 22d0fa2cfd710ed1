// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Event Backbone
//!
//! Each resource the backbone talks to has its own error enum: the broker
//! (`BrokerError`), the durable store (`StoreError`), the publishing path
//! (`PublishError`) and the consumer handlers (`HandlerError`). Transport and
//! store errors are always surfaced to the immediate caller; the consumer and
//! the scheduler decide what to do with them.

use thiserror::Error;

/// Errors raised by a broker adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached or the connection is gone
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// An exchange or queue already exists with incompatible parameters
    #[error("topology conflict: {0}")]
    TopologyConflict(String),

    /// The broker answered with something the adapter did not expect
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The broker returned a mandatory message because no queue matched
    #[error("message with routing key `{0}` is unroutable")]
    Unroutable(String),
}

/// Errors raised by the durable store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// A conditional update lost against a concurrent writer
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// A uniqueness or integrity constraint rejected the write
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// A persisted row could not be decoded
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Errors returned by the event publisher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The broker adapter failed to accept the message
    #[error("failure to publish, broker unreachable: {0}")]
    Unreachable(String),

    /// No topic binding matches the event's routing key
    #[error("no binding matches routing key `{0}`")]
    Unroutable(String),

    /// The payload could not be serialized
    #[error("failure to encode event: {0}")]
    Encoding(String),
}

impl From<BrokerError> for PublishError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unroutable(key) => PublishError::Unroutable(key),
            other => PublishError::Unreachable(other.to_string()),
        }
    }
}

/// Failure reported by an event handler.
///
/// `retryable` tells the consumer whether the failure is worth another
/// attempt (network timeouts, unavailable downstreams) or whether the event
/// should go straight to the dead letter store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{cause}")]
pub struct HandlerError {
    pub retryable: bool,
    pub cause: String,
}

impl HandlerError {
    pub fn retryable(cause: impl Into<String>) -> Self {
        HandlerError {
            retryable: true,
            cause: cause.into(),
        }
    }

    pub fn fatal(cause: impl Into<String>) -> Self {
        HandlerError {
            retryable: false,
            cause: cause.into(),
        }
    }
}

/// Errors raised while loading configuration from the environment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: &'static str, value: String },

    #[error("`{0}` must be at least 1")]
    MustBePositive(&'static str),
}
