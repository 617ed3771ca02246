// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Gateway
//!
//! The outward-facing publish surface of the crate. Every outbound message
//! goes through the channel marked as default and is subject to the configured
//! degraded-mode policy:
//!
//! * `reject_*_when_disconnected` fails the call immediately while the broker
//!   is unreachable, without attempting a send;
//! * `wait_for_broker_ack` awaits the publisher confirm and surfaces transport
//!   errors and broker nacks to the caller;
//! * with neither, the call resolves right away and the send proceeds on a
//!   background task whose failures are only logged. This fire-and-forget
//!   mode can lose messages while the broker is unreachable.

use crate::{
    channel::ChannelManager,
    config::PublishPolicy,
    errors::AmqpError,
    otel,
    supervisor::ConnectionState,
};
use lapin::{
    options::BasicPublishOptions,
    publisher_confirm::Confirmation,
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::error;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publishes messages through the default managed channel, applying the
/// disconnected-mode policy at call time.
pub struct PublishGateway {
    manager: Arc<ChannelManager>,
    state: watch::Receiver<ConnectionState>,
    policy: PublishPolicy,
}

impl PublishGateway {
    pub fn new(
        manager: Arc<ChannelManager>,
        state: watch::Receiver<ConnectionState>,
        policy: PublishPolicy,
    ) -> Arc<PublishGateway> {
        Arc::new(PublishGateway {
            manager,
            state,
            policy,
        })
    }

    /// Publishes a message to the given exchange with the given routing key.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        self.dispatch(
            exchange,
            routing_key,
            payload,
            self.policy.reject_publish_when_disconnected,
        )
        .await
    }

    /// Sends a message directly to a queue through the default exchange.
    pub async fn send_to_queue(&self, queue: &str, payload: &[u8]) -> Result<(), AmqpError> {
        self.dispatch("", queue, payload, self.policy.reject_send_when_disconnected)
            .await
    }

    async fn dispatch(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        reject_when_disconnected: bool,
    ) -> Result<(), AmqpError> {
        let connected = *self.state.borrow() == ConnectionState::Connected;

        if reject_when_disconnected && !connected {
            return Err(AmqpError::DisconnectedError);
        }

        let properties = self.properties();

        if self.policy.wait_for_broker_ack {
            return self
                .publish_confirmed(exchange, routing_key, payload, properties)
                .await;
        }

        self.publish_background(exchange, routing_key, payload, properties);
        Ok(())
    }

    /// Publishes and awaits the broker confirmation. The default channel runs
    /// in confirm mode whenever this policy is active.
    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let Some(handle) = self.manager.default_handle().filter(|h| h.is_ready()) else {
            return Err(AmqpError::DisconnectedError);
        };

        let confirm = match handle
            .channel()
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(AmqpError::PublishingError);
            }
        };

        match confirm.await {
            Ok(Confirmation::Nack(_)) => Err(AmqpError::PublishNackError),
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error awaiting publish confirmation");
                Err(AmqpError::PublishingError)
            }
        }
    }

    /// Fire-and-forget path: resolves immediately, failures are only logged.
    fn publish_background(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) {
        let handle = self.manager.default_handle();
        let exchange = exchange.to_owned();
        let routing_key = routing_key.to_owned();
        let payload = payload.to_vec();

        tokio::spawn(async move {
            let Some(handle) = handle.filter(|h| h.is_ready()) else {
                error!(
                    exchange = exchange,
                    routing_key = routing_key,
                    "message dropped, no ready channel to publish on"
                );
                return;
            };

            let _pending = handle.track_pending();

            match handle
                .channel()
                .basic_publish(
                    &exchange,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await
            {
                Ok(confirm) => {
                    if let Err(err) = confirm.await {
                        error!(error = err.to_string(), "error publishing message");
                    }
                }
                Err(err) => error!(error = err.to_string(), "error publishing message"),
            }
        });
    }

    fn properties(&self) -> BasicProperties {
        let mut headers = BTreeMap::new();
        otel::inject(&Context::current(), &mut headers);

        let properties = BasicProperties::default()
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        if self.manager.use_json_encoding() {
            properties.with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        } else {
            properties
        }
    }
}
