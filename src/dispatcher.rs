// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatch Table
//!
//! This module defines the routes supplied at startup, the handler traits the
//! host application implements, and the dispatch table that maps inbound
//! deliveries to handlers.
//!
//! The table is resolved once, before any connection attempt, and never
//! changes afterwards. A route whose handler cannot be resolved is fatal: the
//! process must not begin consuming with holes in the table. Lookup is by
//! queue name and is one-to-one; a queue is owned by exactly one route on
//! exactly one channel.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::types::FieldTable;
use opentelemetry::Context;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

fn default_channel() -> String {
    "default".to_owned()
}

/// A configured mapping from a queue to a named handler.
#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    pub handler_name: String,
    pub queue: String,
    /// Name of the channel the consumer is registered on.
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Optional filter on the message `kind` property. Deliveries with a
    /// different kind are dropped (acked) without reaching the handler.
    #[serde(default)]
    pub message_type: Option<String>,
}

impl Route {
    pub fn new(handler_name: &str, queue: &str) -> Route {
        Route {
            handler_name: handler_name.to_owned(),
            queue: queue.to_owned(),
            channel: default_channel(),
            message_type: None,
        }
    }

    pub fn channel(mut self, channel: &str) -> Self {
        self.channel = channel.to_owned();
        self
    }

    pub fn message_type(mut self, message_type: &str) -> Self {
        self.message_type = Some(message_type.to_owned());
        self
    }
}

/// Decoded payload of an inbound delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Json(serde_json::Value),
    Raw(Vec<u8>),
}

/// An inbound delivery as seen by a handler: decoded body plus delivery
/// metadata.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub queue: String,
    pub body: MessageBody,
    pub routing_key: String,
    pub message_type: Option<String>,
    pub headers: FieldTable,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// A message handler registered for a queue.
///
/// Returning `Ok` acknowledges the delivery; returning an error leaves it
/// unacknowledged, and whatever requeue or dead-letter behavior applies is
/// decided by the queue configuration on the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &InboundMessage) -> Result<(), AmqpError>;
}

/// External collaborator that turns a configured route into a callable
/// handler. A `None` at startup is fatal.
#[cfg_attr(test, automock)]
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, route: &Route) -> Option<Arc<dyn ConsumerHandler>>;
}

/// A route paired with its resolved handler.
#[derive(Clone)]
pub struct HandlerBinding {
    pub route: Route,
    pub handler: Arc<dyn ConsumerHandler>,
}

/// The immutable queue-to-handler mapping consumers dispatch through.
pub struct DispatchTable {
    bindings: HashMap<String, HandlerBinding>,
}

impl DispatchTable {
    /// Resolves every configured route into a handler binding.
    ///
    /// Fails with a configuration error when a handler cannot be resolved or
    /// when two routes target the same queue.
    pub fn resolve(
        routes: &[Route],
        resolver: &dyn HandlerResolver,
    ) -> Result<DispatchTable, AmqpError> {
        let mut bindings = HashMap::new();

        for route in routes {
            let Some(handler) = resolver.resolve(route) else {
                return Err(AmqpError::ConfigurationError(format!(
                    "no handler found for route `{}` on queue `{}`",
                    route.handler_name, route.queue
                )));
            };

            debug!(
                handler = route.handler_name,
                queue = route.queue,
                channel = route.channel,
                "handler bound"
            );

            let previous = bindings.insert(
                route.queue.clone(),
                HandlerBinding {
                    route: route.clone(),
                    handler,
                },
            );

            if previous.is_some() {
                return Err(AmqpError::ConfigurationError(format!(
                    "queue `{}` is targeted by more than one route",
                    route.queue
                )));
            }
        }

        Ok(DispatchTable { bindings })
    }

    /// The binding owning the given queue, if any.
    pub fn get(&self, queue: &str) -> Option<&HandlerBinding> {
        self.bindings.get(queue)
    }

    /// All bindings whose route targets the given channel.
    pub fn bindings_for_channel(&self, channel: &str) -> Vec<HandlerBinding> {
        let mut bindings: Vec<HandlerBinding> = self
            .bindings
            .values()
            .filter(|b| b.route.channel == channel)
            .cloned()
            .collect();

        bindings.sort_by(|a, b| a.route.queue.cmp(&b.route.queue));
        bindings
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_returning_handler() -> MockHandlerResolver {
        let mut resolver = MockHandlerResolver::new();
        resolver
            .expect_resolve()
            .returning(|_| Some(Arc::new(MockConsumerHandler::new()) as Arc<dyn ConsumerHandler>));
        resolver
    }

    #[test]
    fn resolves_routes_into_bindings() {
        let routes = vec![
            Route::new("orders.created", "orders"),
            Route::new("billing.invoiced", "invoices").channel("billing"),
        ];

        let table = DispatchTable::resolve(&routes, &resolver_returning_handler()).unwrap();

        assert!(table.get("orders").is_some());
        assert!(table.get("invoices").is_some());
        assert!(table.get("unknown").is_none());
        assert_eq!(table.bindings_for_channel("default").len(), 1);
        assert_eq!(table.bindings_for_channel("billing").len(), 1);
        assert_eq!(table.bindings_for_channel("metrics").len(), 0);
    }

    #[test]
    fn unresolved_handler_is_fatal() {
        let mut resolver = MockHandlerResolver::new();
        resolver.expect_resolve().returning(|_| None);

        let err =
            DispatchTable::resolve(&[Route::new("orders.created", "orders")], &resolver).unwrap_err();

        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[test]
    fn two_routes_on_one_queue_are_fatal() {
        let routes = vec![
            Route::new("orders.created", "orders"),
            Route::new("orders.audited", "orders"),
        ];

        let err = DispatchTable::resolve(&routes, &resolver_returning_handler()).unwrap_err();
        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[test]
    fn empty_route_set_resolves_to_an_empty_table() {
        let table = DispatchTable::resolve(&[], &resolver_returning_handler()).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn route_defaults_to_the_default_channel() {
        let route = Route::new("orders.created", "orders");
        assert_eq!(route.channel, "default");
        assert_eq!(route.message_type, None);
    }
}
