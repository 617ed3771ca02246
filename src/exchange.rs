// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Specifications
//!
//! This module provides the types used to declare RabbitMQ exchanges as part
//! of a channel topology. Specs are declared once at startup and re-asserted
//! verbatim on every reconnect, so declaration must stay idempotent: the same
//! spec against an existing exchange is a no-op, a mismatched spec is reported
//! by the broker as a channel-setup failure.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: routes messages to queues on an exact routing-key match
/// - Fanout: broadcasts messages to all bound queues
/// - Topic: routes messages by wildcard pattern matching of routing keys
/// - Headers: routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Declaration of a RabbitMQ exchange with its configuration parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
}

impl ExchangeSpec {
    /// Creates a direct exchange spec with default parameters.
    pub fn new(name: &str) -> ExchangeSpec {
        ExchangeSpec {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
            internal: false,
            passive: false,
            no_wait: false,
            args: BTreeMap::default(),
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    pub fn headers(mut self) -> Self {
        self.kind = ExchangeKind::Headers;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Adds a single declaration argument to the exchange.
    pub fn arg(mut self, key: &str, value: serde_json::Value) -> Self {
        self.args.insert(key.to_owned(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_to_lapin_exchange_kinds() {
        assert_eq!(
            lapin::ExchangeKind::from(&ExchangeKind::Direct),
            lapin::ExchangeKind::Direct
        );
        assert_eq!(
            lapin::ExchangeKind::from(&ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        );
        assert_eq!(
            lapin::ExchangeKind::from(&ExchangeKind::Fanout),
            lapin::ExchangeKind::Fanout
        );
        assert_eq!(
            lapin::ExchangeKind::from(&ExchangeKind::Headers),
            lapin::ExchangeKind::Headers
        );
    }

    #[test]
    fn deserializes_kind_from_lowercase_names() {
        let spec: ExchangeSpec =
            serde_json::from_str(r#"{ "name": "events", "kind": "topic", "durable": true }"#)
                .unwrap();

        assert_eq!(spec.kind, ExchangeKind::Topic);
        assert!(spec.durable);
        assert!(!spec.auto_delete);
    }
}
