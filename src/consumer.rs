// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! This module implements the per-delivery contract of the dispatch table:
//! decode the payload, invoke the handler bound to the queue, and acknowledge
//! only after the handler returned success. A failed handler leaves the
//! delivery unacknowledged; whether it is redelivered or dead-lettered is
//! entirely up to the queue configuration on the broker.
//!
//! A delivery whose `kind` property does not match the route's message-type
//! filter is acknowledged and dropped without reaching the handler.

use crate::{
    dispatcher::{HandlerBinding, InboundMessage, MessageBody},
    errors::AmqpError,
    otel,
};
use lapin::{message::Delivery, options::BasicAckOptions, types::FieldTable};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::borrow::Cow;
use tracing::{debug, error};

/// What happened to a delivery, and with it whether it must be acknowledged.
#[derive(Debug)]
pub(crate) enum DeliveryOutcome {
    /// Handler completed: acknowledge.
    Handled,
    /// Message-type filter mismatch: acknowledge and drop.
    Skipped,
    /// Decode or handler failure: leave unacknowledged.
    Failed(AmqpError),
}

impl DeliveryOutcome {
    pub(crate) fn should_ack(&self) -> bool {
        matches!(self, DeliveryOutcome::Handled | DeliveryOutcome::Skipped)
    }
}

/// Raw fields of a delivery, separated from the transport type so the
/// dispatch decision can be exercised without a broker.
pub(crate) struct RawDelivery {
    pub(crate) kind: Option<String>,
    pub(crate) routing_key: String,
    pub(crate) headers: FieldTable,
    pub(crate) delivery_tag: u64,
    pub(crate) redelivered: bool,
    pub(crate) data: Vec<u8>,
}

impl RawDelivery {
    fn from_delivery(delivery: &Delivery) -> RawDelivery {
        RawDelivery {
            kind: delivery.properties.kind().clone().map(|k| k.to_string()),
            routing_key: delivery.routing_key.to_string(),
            headers: delivery.properties.headers().clone().unwrap_or_default(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            data: delivery.data.clone(),
        }
    }
}

/// Processes one delivery from a consumer stream and applies the resulting
/// acknowledgment.
pub(crate) async fn process_delivery(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    binding: &HandlerBinding,
    use_json_encoding: bool,
) -> Result<(), AmqpError> {
    let raw = RawDelivery::from_delivery(delivery);
    let span_name = raw.kind.clone().unwrap_or_else(|| binding.route.queue.clone());

    let (ctx, mut span) = otel::consumer_span(&delivery.properties, tracer, &span_name);

    debug!(
        "received: {} - exchange: {}",
        span_name,
        delivery.exchange.to_string(),
    );

    let outcome = dispatch(&ctx, binding, use_json_encoding, raw).await;

    match &outcome {
        DeliveryOutcome::Handled => span.set_status(Status::Ok),
        DeliveryOutcome::Skipped => span.set_status(Status::Ok),
        DeliveryOutcome::Failed(err) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }

    if !outcome.should_ack() {
        return Ok(());
    }

    if let Err(e) = delivery.ack(BasicAckOptions { multiple: false }).await {
        error!("error whiling ack msg");
        span.record_error(&e);
        span.set_status(Status::Error {
            description: Cow::from("error to ack msg"),
        });
        return Err(AmqpError::AckMessageError);
    }

    Ok(())
}

/// Runs the dispatch contract for one delivery: filter, decode, invoke.
pub(crate) async fn dispatch(
    ctx: &Context,
    binding: &HandlerBinding,
    use_json_encoding: bool,
    raw: RawDelivery,
) -> DeliveryOutcome {
    if let Some(filter) = &binding.route.message_type {
        if raw.kind.as_deref() != Some(filter.as_str()) {
            debug!("removing message from queue - reason: unsupported msg type");
            return DeliveryOutcome::Skipped;
        }
    }

    let body = match decode_body(&raw.data, use_json_encoding) {
        Ok(body) => body,
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = binding.route.queue,
                "failure to decode message payload"
            );
            return DeliveryOutcome::Failed(err);
        }
    };

    let msg = InboundMessage {
        queue: binding.route.queue.clone(),
        body,
        routing_key: raw.routing_key,
        message_type: raw.kind,
        headers: raw.headers,
        delivery_tag: raw.delivery_tag,
        redelivered: raw.redelivered,
    };

    match binding.handler.exec(ctx, &msg).await {
        Ok(_) => {
            debug!("message successfully processed");
            DeliveryOutcome::Handled
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                handler = binding.route.handler_name,
                queue = binding.route.queue,
                "handler failed, message left unacknowledged"
            );
            DeliveryOutcome::Failed(AmqpError::HandlerError(
                binding.route.handler_name.clone(),
                err.to_string(),
            ))
        }
    }
}

fn decode_body(data: &[u8], use_json_encoding: bool) -> Result<MessageBody, AmqpError> {
    if !use_json_encoding {
        return Ok(MessageBody::Raw(data.to_vec()));
    }

    match serde_json::from_slice(data) {
        Ok(value) => Ok(MessageBody::Json(value)),
        Err(err) => {
            error!(error = err.to_string(), "failure to parse payload");
            Err(AmqpError::ParsePayloadError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{MockConsumerHandler, Route};
    use std::sync::Arc;

    fn raw(kind: Option<&str>, data: &[u8]) -> RawDelivery {
        RawDelivery {
            kind: kind.map(|k| k.to_owned()),
            routing_key: "orders.created".to_owned(),
            headers: FieldTable::default(),
            delivery_tag: 7,
            redelivered: false,
            data: data.to_vec(),
        }
    }

    fn binding_with(handler: MockConsumerHandler, route: Route) -> HandlerBinding {
        HandlerBinding {
            route,
            handler: Arc::new(handler),
        }
    }

    #[tokio::test]
    async fn successful_handler_leads_to_ack() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().times(1).returning(|_, _| Ok(()));

        let binding = binding_with(handler, Route::new("orders.created", "orders"));
        let outcome = dispatch(&Context::new(), &binding, false, raw(None, b"payload")).await;

        assert!(matches!(outcome, DeliveryOutcome::Handled));
        assert!(outcome.should_ack());
    }

    #[tokio::test]
    async fn failed_handler_leaves_message_unacked() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(1)
            .returning(|_, _| Err(AmqpError::ParsePayloadError));

        let binding = binding_with(handler, Route::new("orders.created", "orders"));
        let outcome = dispatch(&Context::new(), &binding, false, raw(None, b"payload")).await;

        assert!(matches!(outcome, DeliveryOutcome::Failed(_)));
        assert!(!outcome.should_ack());
    }

    #[tokio::test]
    async fn mismatched_message_type_is_dropped_without_invoking_the_handler() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().times(0);

        let binding = binding_with(
            handler,
            Route::new("orders.created", "orders").message_type("order.created"),
        );
        let outcome = dispatch(
            &Context::new(),
            &binding,
            false,
            raw(Some("order.deleted"), b"payload"),
        )
        .await;

        assert!(matches!(outcome, DeliveryOutcome::Skipped));
        assert!(outcome.should_ack());
    }

    #[tokio::test]
    async fn matching_message_type_reaches_the_handler() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().times(1).returning(|_, _| Ok(()));

        let binding = binding_with(
            handler,
            Route::new("orders.created", "orders").message_type("order.created"),
        );
        let outcome = dispatch(
            &Context::new(),
            &binding,
            false,
            raw(Some("order.created"), b"payload"),
        )
        .await;

        assert!(matches!(outcome, DeliveryOutcome::Handled));
    }

    #[tokio::test]
    async fn invalid_json_never_reaches_the_handler_and_stays_unacked() {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().times(0);

        let binding = binding_with(handler, Route::new("orders.created", "orders"));
        let outcome = dispatch(&Context::new(), &binding, true, raw(None, b"not-json")).await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::Failed(AmqpError::ParsePayloadError)
        ));
        assert!(!outcome.should_ack());
    }

    #[tokio::test]
    async fn json_bodies_are_decoded_for_the_handler() {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(1)
            .withf(|_, msg| {
                msg.body == MessageBody::Json(serde_json::json!({ "id": 42 }))
                    && msg.routing_key == "orders.created"
                    && msg.delivery_tag == 7
            })
            .returning(|_, _| Ok(()));

        let binding = binding_with(handler, Route::new("orders.created", "orders"));
        let outcome = dispatch(&Context::new(), &binding, true, raw(None, br#"{"id":42}"#)).await;

        assert!(matches!(outcome, DeliveryOutcome::Handled));
    }
}
