// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Runtime Assembly
//!
//! Wires the components into a running supervised messaging layer. The
//! startup sequence is strict about what may fail where: configuration and
//! route resolution fail before any connection attempt, the liveness budget
//! fails startup once exhausted, and everything after that point is contained
//! and healed through reconnect cycles.

use crate::{
    channel::ChannelManager,
    config::{resolve_endpoints, AmqpConfig},
    dispatcher::{DispatchTable, HandlerResolver},
    errors::AmqpError,
    liveness::LivenessValidator,
    monitor::BacklogMonitor,
    publisher::PublishGateway,
    supervisor::ConnectionSupervisor,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A running supervised messaging layer.
///
/// Holds the supervisor, the channel manager and the publish gateway, plus
/// the background tasks keeping them alive. Dropping the runtime does not
/// stop the tasks; call [`shutdown`](Self::shutdown) for that.
pub struct AmqpRuntime {
    supervisor: Arc<ConnectionSupervisor>,
    manager: Arc<ChannelManager>,
    gateway: Arc<PublishGateway>,
    tasks: Vec<JoinHandle<()>>,
}

impl AmqpRuntime {
    /// Validates the configuration, resolves the dispatch table, and brings
    /// the supervised connection up.
    ///
    /// Returns a configuration error before any connection attempt when the
    /// config or a route is invalid, and a liveness error when the broker
    /// does not come up within the startup budget. Any other failure is
    /// logged and healed by the reconnect loop.
    pub async fn start(
        config: AmqpConfig,
        resolver: &dyn HandlerResolver,
    ) -> Result<AmqpRuntime, AmqpError> {
        config.validate()?;

        let urls = resolve_endpoints(&config.connections, &config.options)?;
        let table = Arc::new(DispatchTable::resolve(&config.routes, resolver)?);

        debug!(endpoints = urls.len(), "starting supervised amqp runtime");

        let supervisor = ConnectionSupervisor::new(urls, config.options.clone());
        let supervisor_task = supervisor.spawn();

        let manager = ChannelManager::new(
            config.channels.clone(),
            table,
            &config.options,
            &config.policy,
        );
        let manager_task = manager.run(supervisor.clone());

        let gateway = PublishGateway::new(
            manager.clone(),
            supervisor.subscribe(),
            config.policy.clone(),
        );

        if let Err(err) = LivenessValidator::default()
            .validate(supervisor.subscribe())
            .await
        {
            supervisor_task.abort();
            manager_task.abort();
            return Err(err);
        }

        let monitor_task = BacklogMonitor::default().spawn(manager.clone());

        Ok(AmqpRuntime {
            supervisor,
            manager,
            gateway,
            tasks: vec![supervisor_task, manager_task, monitor_task],
        })
    }

    /// The outward-facing publish surface.
    pub fn publisher(&self) -> Arc<PublishGateway> {
        self.gateway.clone()
    }

    pub fn channels(&self) -> Arc<ChannelManager> {
        self.manager.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.supervisor.is_connected()
    }

    /// Stops the supervision, reconfiguration and monitor tasks.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelSpec,
        config::{ConnectionDescriptor, PublishPolicy},
        dispatcher::{MockHandlerResolver, Route},
    };

    #[tokio::test]
    async fn invalid_config_fails_before_any_connection_attempt() {
        let config = AmqpConfig {
            connections: vec![],
            options: Default::default(),
            channels: vec![ChannelSpec::new("default").default_channel()],
            routes: vec![],
            policy: PublishPolicy::default(),
        };

        let err = AmqpRuntime::start(config, &MockHandlerResolver::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn unresolved_route_fails_before_any_connection_attempt() {
        let mut resolver = MockHandlerResolver::new();
        resolver.expect_resolve().returning(|_| None);

        let config = AmqpConfig {
            connections: vec![ConnectionDescriptor::new("localhost")],
            options: Default::default(),
            channels: vec![ChannelSpec::new("default")
                .default_channel()
                .queue(crate::queue::QueueSpec::new("orders"))],
            routes: vec![Route::new("orders.created", "orders")],
            policy: PublishPolicy::default(),
        };

        let err = AmqpRuntime::start(config, &resolver).await.unwrap_err();
        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }
}
