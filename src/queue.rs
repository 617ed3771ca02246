// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue and Binding Specifications
//!
//! This module provides the types used to declare RabbitMQ queues and the
//! bindings linking them to exchanges. Like exchanges, queue and binding specs
//! are immutable after startup and re-asserted on every reconnect cycle.
//!
//! TTL, max-length and dead-letter behavior are expressed through the standard
//! `x-` queue arguments; the crate itself never enforces a requeue policy.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Declaration of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub message_ttl: Option<i32>,
    #[serde(default)]
    pub max_length: Option<i32>,
    #[serde(default)]
    pub max_length_bytes: Option<i32>,
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
}

impl QueueSpec {
    /// Creates a queue spec with default settings (non-durable, non-exclusive).
    pub fn new(name: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_owned(),
            ..QueueSpec::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Sets the message Time-To-Live for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a single declaration argument to the queue.
    pub fn arg(mut self, key: &str, value: serde_json::Value) -> Self {
        self.args.insert(key.to_owned(), value);
        self
    }
}

/// A routing rule linking an exchange to a queue via a routing key pattern.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
}

impl BindingSpec {
    /// Creates a binding for the given queue. Exchange and routing key default
    /// to empty and are set through [`exchange`](Self::exchange) and
    /// [`routing_key`](Self::routing_key).
    pub fn new(queue: &str) -> BindingSpec {
        BindingSpec {
            queue: queue.to_owned(),
            exchange: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_queue_spec_with_options() {
        let spec = QueueSpec::new("orders").durable().ttl(60_000).max_length(500);

        assert_eq!(spec.name, "orders");
        assert!(spec.durable);
        assert!(!spec.exclusive);
        assert_eq!(spec.message_ttl, Some(60_000));
        assert_eq!(spec.max_length, Some(500));
        assert_eq!(spec.max_length_bytes, None);
    }

    #[test]
    fn builds_binding_spec() {
        let binding = BindingSpec::new("orders")
            .exchange("commerce")
            .routing_key("orders.*");

        assert_eq!(binding.queue, "orders");
        assert_eq!(binding.exchange, "commerce");
        assert_eq!(binding.routing_key, "orders.*");
    }
}
