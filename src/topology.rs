// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Assertion
//!
//! This module installs a channel's declared topology on the broker: all
//! exchanges, then all queues, then all bindings. Within a batch the
//! declarations are issued concurrently; the batches themselves are sequenced
//! so that no binding is asserted before every exchange and queue it may
//! reference exists.
//!
//! Installation is idempotent. Re-asserting an existing entity with identical
//! parameters is a no-op on the broker side; a parameter mismatch comes back
//! as a declaration error and fails the whole channel setup.

use crate::{
    channel::ChannelSpec,
    errors::AmqpError,
    exchange::ExchangeSpec,
    queue::{
        BindingSpec, QueueSpec, AMQP_HEADERS_MAX_LENGTH, AMQP_HEADERS_MAX_LENGTH_BYTES,
        AMQP_HEADERS_MESSAGE_TTL,
    },
};
use futures_util::future::try_join_all;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Asserts the full topology of a channel spec on the given channel.
///
/// Exchanges and queues both complete before any binding is asserted. The
/// first failed declaration abandons the rest of the setup; healing is left to
/// the next reconnect cycle.
pub(crate) async fn install_topology(channel: &Channel, spec: &ChannelSpec) -> Result<(), AmqpError> {
    try_join_all(spec.exchanges.iter().map(|e| declare_exchange(channel, e))).await?;
    try_join_all(spec.queues.iter().map(|q| declare_queue(channel, q))).await?;
    try_join_all(spec.bindings.iter().map(|b| bind_queue(channel, b))).await?;

    debug!(channel = spec.name, "topology installed");

    Ok(())
}

async fn declare_exchange(channel: &Channel, spec: &ExchangeSpec) -> Result<(), AmqpError> {
    debug!("declaring exchange: {}", spec.name);

    match channel
        .exchange_declare(
            &spec.name,
            (&spec.kind).into(),
            ExchangeDeclareOptions {
                passive: spec.passive,
                durable: spec.durable,
                auto_delete: spec.auto_delete,
                internal: spec.internal,
                nowait: spec.no_wait,
            },
            field_table(&spec.args),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = spec.name,
                "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError(spec.name.clone()))
        }
        _ => Ok(()),
    }
}

async fn declare_queue(channel: &Channel, spec: &QueueSpec) -> Result<(), AmqpError> {
    debug!("declaring queue: {}", spec.name);

    match channel
        .queue_declare(
            &spec.name,
            QueueDeclareOptions {
                passive: spec.passive,
                durable: spec.durable,
                exclusive: spec.exclusive,
                auto_delete: spec.auto_delete,
                nowait: spec.no_wait,
            },
            queue_arguments(spec),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = spec.name,
                "error to declare the queue"
            );
            Err(AmqpError::DeclareQueueError(spec.name.clone()))
        }
        _ => Ok(()),
    }
}

async fn bind_queue(channel: &Channel, binding: &BindingSpec) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue, binding.exchange, binding.routing_key
    );

    match channel
        .queue_bind(
            &binding.queue,
            &binding.exchange,
            &binding.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(AmqpError::BindQueueError(
                binding.queue.clone(),
                binding.exchange.clone(),
            ))
        }
        _ => Ok(()),
    }
}

/// Assembles the declaration arguments of a queue, folding the TTL and length
/// limits into their `x-` headers next to any raw arguments.
pub(crate) fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = BTreeMap::new();

    for (key, value) in &spec.args {
        if let Some(value) = amqp_value(value) {
            args.insert(ShortString::from(key.clone()), value);
        }
    }

    if let Some(ttl) = spec.message_ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = spec.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(max_bytes) = spec.max_length_bytes {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        );
    }

    FieldTable::from(args)
}

pub(crate) fn field_table(args: &BTreeMap<String, serde_json::Value>) -> FieldTable {
    let mut table = BTreeMap::new();

    for (key, value) in args {
        if let Some(value) = amqp_value(value) {
            table.insert(ShortString::from(key.clone()), value);
        }
    }

    FieldTable::from(table)
}

fn amqp_value(value: &serde_json::Value) -> Option<AMQPValue> {
    match value {
        serde_json::Value::String(v) => Some(AMQPValue::LongString(LongString::from(v.clone()))),
        serde_json::Value::Bool(v) => Some(AMQPValue::Boolean(*v)),
        serde_json::Value::Number(v) => v.as_i64().map(AMQPValue::LongLongInt),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn folds_limits_into_queue_arguments() {
        let spec = QueueSpec::new("orders").ttl(30_000).max_length(100);
        let args = queue_arguments(&spec);

        assert_eq!(
            args.inner().get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(30_000))
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_MAX_LENGTH),
            Some(&AMQPValue::LongInt(100))
        );
        assert!(args.inner().get(AMQP_HEADERS_MAX_LENGTH_BYTES).is_none());
    }

    #[test]
    fn keeps_raw_queue_arguments() {
        let spec = QueueSpec::new("orders")
            .arg("x-dead-letter-exchange", json!(""))
            .arg("x-dead-letter-routing-key", json!("orders-dlq"))
            .arg("x-single-active-consumer", json!(true));

        let args = queue_arguments(&spec);

        assert_eq!(
            args.inner().get("x-dead-letter-routing-key"),
            Some(&AMQPValue::LongString("orders-dlq".into()))
        );
        assert_eq!(
            args.inner().get("x-single-active-consumer"),
            Some(&AMQPValue::Boolean(true))
        );
    }

    #[test]
    fn identical_specs_produce_identical_arguments() {
        let args_a = queue_arguments(&QueueSpec::new("orders").ttl(1000));
        let args_b = queue_arguments(&QueueSpec::new("orders").ttl(1000));

        assert_eq!(args_a.inner(), args_b.inner());
    }
}
