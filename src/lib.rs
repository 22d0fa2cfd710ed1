// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

pub mod amqp;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod errors;
pub mod event;
pub mod logging;
pub mod outbox;
pub mod publisher;
pub mod retry;
pub mod store;
pub mod topology;
