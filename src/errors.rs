// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Supervised RabbitMQ Layer
//!
//! This module provides the error taxonomy for the whole crate. The `AmqpError`
//! enum covers startup configuration failures, connection and channel setup
//! failures, per-message handling failures, and publish failures.
//!
//! Only two classes are fatal: `ConfigurationError`, raised before any
//! connection attempt, and `LivenessTimeoutError`, raised when the broker
//! cannot be reached within the startup budget. Everything else is contained
//! at the component where it occurs and surfaces through logs.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid startup configuration. Fatal, raised before any connection attempt.
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error configuring Quality of Service parameters on a channel
    #[error("failure to configure qos on channel `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error registering a consumer on a queue
    #[error("failure to create a consumer on queue `{0}`")]
    CreateConsumerError(String),

    /// The broker connection is down and the operation was configured to reject
    #[error("not connected to the broker")]
    DisconnectedError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker refused a published message while confirms were enabled
    #[error("publish was nacked by the broker")]
    PublishNackError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// A registered handler reported a failure for a delivery
    #[error("handler `{0}` failed: {1}")]
    HandlerError(String, String),

    /// The broker did not become reachable within the startup liveness budget
    #[error("broker unreachable within the startup liveness budget")]
    LivenessTimeoutError,
}
