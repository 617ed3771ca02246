// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Managed Channels
//!
//! This module manages the per-purpose channels multiplexed over the
//! supervised connection. Every configured channel spec gets a managed
//! channel whose topology is re-asserted and whose consumers are re-registered
//! on every reconnect cycle; handles are re-created each cycle, never reused.
//!
//! A channel setup that fails at any step is abandoned wholesale: the handle
//! is marked Errored, the failure is logged, and the next reconnect cycle
//! re-creates the channel from scratch. The manager never retries in a tight
//! loop of its own.

use crate::{
    config::{ConnectionConfig, PublishPolicy},
    consumer::process_delivery,
    dispatcher::{DispatchTable, HandlerBinding},
    errors::AmqpError,
    exchange::ExchangeSpec,
    queue::{BindingSpec, QueueSpec},
    supervisor::{ConnectionState, ConnectionSupervisor},
    topology::install_topology,
};
use futures_util::{future::join_all, StreamExt};
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions, ConfirmSelectOptions},
    types::FieldTable,
    Channel, Connection, Consumer,
};
use opentelemetry::global;
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

fn default_prefetch() -> u16 {
    1
}

/// Declaration of a managed channel: its prefetch window and the topology it
/// asserts on every (re)connect.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    /// Exactly one spec in a configuration carries this flag; the publish
    /// gateway always targets that channel.
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
    #[serde(default)]
    pub exchanges: Vec<ExchangeSpec>,
    #[serde(default)]
    pub queues: Vec<QueueSpec>,
    #[serde(default)]
    pub bindings: Vec<BindingSpec>,
}

impl ChannelSpec {
    pub fn new(name: &str) -> ChannelSpec {
        ChannelSpec {
            name: name.to_owned(),
            is_default: false,
            prefetch_count: default_prefetch(),
            exchanges: vec![],
            queues: vec![],
            bindings: vec![],
        }
    }

    pub fn default_channel(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    pub fn exchange(mut self, spec: ExchangeSpec) -> Self {
        self.exchanges.push(spec);
        self
    }

    pub fn queue(mut self, spec: QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }

    pub fn binding(mut self, spec: BindingSpec) -> Self {
        self.bindings.push(spec);
        self
    }
}

/// Health of a managed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHealth {
    /// Channel opened, topology setup not finished yet.
    Pending,
    /// Topology asserted and consumers registered; usable for publishing.
    Ready,
    /// The backing connection went away.
    Closed,
    /// Setup failed; healed by the next reconnect cycle.
    Errored,
}

/// A managed channel created for one spec during one connection cycle.
pub struct ChannelHandle {
    name: String,
    channel: Arc<Channel>,
    health: RwLock<ChannelHealth>,
    pending_outbound: Arc<AtomicUsize>,
}

impl ChannelHandle {
    pub(crate) fn new(name: &str, channel: Channel) -> Arc<ChannelHandle> {
        Arc::new(ChannelHandle {
            name: name.to_owned(),
            channel: Arc::new(channel),
            health: RwLock::new(ChannelHealth::Pending),
            pending_outbound: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn health(&self) -> ChannelHealth {
        *self.health.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        self.health() == ChannelHealth::Ready
    }

    /// Number of outbound messages currently in flight on this channel.
    pub fn pending_outbound(&self) -> usize {
        self.pending_outbound.load(Ordering::Relaxed)
    }

    pub(crate) fn set_health(&self, health: ChannelHealth) {
        *self.health.write().unwrap_or_else(|e| e.into_inner()) = health;
    }

    pub(crate) fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    pub(crate) fn track_pending(&self) -> PendingGuard {
        PendingGuard::new(self.pending_outbound.clone())
    }
}

/// Holds a slot in a channel's pending-outbound count for as long as a send
/// is in flight. Released on drop, including on the failure path.
pub(crate) struct PendingGuard {
    counter: Arc<AtomicUsize>,
}

impl PendingGuard {
    pub(crate) fn new(counter: Arc<AtomicUsize>) -> PendingGuard {
        counter.fetch_add(1, Ordering::Relaxed);
        PendingGuard { counter }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Creates and re-creates the managed channels over the supervised connection.
pub struct ChannelManager {
    specs: Vec<ChannelSpec>,
    table: Arc<DispatchTable>,
    use_json_encoding: bool,
    confirm_publishes: bool,
    default_channel: String,
    handles: RwLock<HashMap<String, Arc<ChannelHandle>>>,
}

impl ChannelManager {
    pub fn new(
        specs: Vec<ChannelSpec>,
        table: Arc<DispatchTable>,
        options: &ConnectionConfig,
        policy: &PublishPolicy,
    ) -> Arc<ChannelManager> {
        let default_channel = specs
            .iter()
            .find(|s| s.is_default)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "default".to_owned());

        Arc::new(ChannelManager {
            specs,
            table,
            use_json_encoding: options.use_json_encoding,
            confirm_publishes: policy.wait_for_broker_ack,
            default_channel,
            handles: RwLock::new(HashMap::default()),
        })
    }

    /// Spawns the reconfiguration task: waits for the supervisor to signal
    /// Connected, runs the channel setup, and marks every handle Closed when
    /// the connection goes away again.
    pub fn run(self: &Arc<Self>, supervisor: Arc<ConnectionSupervisor>) -> JoinHandle<()> {
        let manager = self.clone();

        tokio::spawn(async move {
            let mut state = supervisor.subscribe();

            loop {
                while *state.borrow_and_update() != ConnectionState::Connected {
                    if state.changed().await.is_err() {
                        return;
                    }
                }

                if let Some(conn) = supervisor.connection() {
                    manager.configure_channels(&conn).await;
                }

                loop {
                    if state.changed().await.is_err() {
                        return;
                    }
                    if *state.borrow_and_update() != ConnectionState::Connected {
                        break;
                    }
                }

                manager.mark_all_closed();
            }
        })
    }

    /// Runs the full channel setup for every spec, concurrently across specs.
    ///
    /// Setup failures are contained per channel: logged, the handle marked
    /// Errored, and left for the next reconnect cycle to heal.
    pub async fn configure_channels(&self, conn: &Connection) {
        let results = join_all(
            self.specs
                .iter()
                .map(|spec| self.setup_channel(conn, spec)),
        )
        .await;

        for (spec, result) in self.specs.iter().zip(results) {
            if let Err(err) = result {
                error!(
                    error = err.to_string(),
                    channel = spec.name,
                    "channel setup failed, awaiting next reconnect cycle"
                );
            }
        }
    }

    async fn setup_channel(
        &self,
        conn: &Connection,
        spec: &ChannelSpec,
    ) -> Result<(), AmqpError> {
        debug!(channel = spec.name, "creating amqp channel...");

        let channel = match conn.create_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                return Err(AmqpError::ChannelError);
            }
        };

        let name = spec.name.clone();
        channel.on_error(move |err| {
            error!(error = err.to_string(), channel = name, "channel error");
        });

        let handle = ChannelHandle::new(&spec.name, channel);

        let result = self.prepare_channel(&handle, spec).await;
        match &result {
            Ok(_) => {
                handle.set_health(ChannelHealth::Ready);
                debug!(channel = spec.name, "channel ready");
            }
            Err(_) => handle.set_health(ChannelHealth::Errored),
        }

        self.install_handle(handle);
        result
    }

    /// Prefetch, confirm mode, topology, consumers. The handle stays Pending
    /// until everything here succeeded.
    async fn prepare_channel(
        &self,
        handle: &Arc<ChannelHandle>,
        spec: &ChannelSpec,
    ) -> Result<(), AmqpError> {
        let channel = handle.channel();

        if let Err(err) = channel
            .basic_qos(spec.prefetch_count, BasicQosOptions::default())
            .await
        {
            error!(error = err.to_string(), "error to configure channel qos");
            return Err(AmqpError::QoSDeclarationError(spec.name.clone()));
        }

        if self.confirm_publishes && spec.is_default {
            if let Err(err) = channel.confirm_select(ConfirmSelectOptions::default()).await {
                error!(error = err.to_string(), "error to enable publisher confirms");
                return Err(AmqpError::ChannelError);
            }
        }

        install_topology(&channel, spec).await?;

        for binding in self.table.bindings_for_channel(&spec.name) {
            self.register_consumer(handle, binding).await?;
        }

        Ok(())
    }

    async fn register_consumer(
        &self,
        handle: &Arc<ChannelHandle>,
        binding: HandlerBinding,
    ) -> Result<(), AmqpError> {
        let queue = binding.route.queue.clone();

        let consumer = match handle
            .channel()
            .basic_consume(
                &queue,
                &binding.route.handler_name,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                return Err(AmqpError::CreateConsumerError(queue));
            }
        };

        debug!(
            queue = queue,
            channel = handle.name(),
            handler = binding.route.handler_name,
            "consumer registered"
        );

        tokio::spawn(run_consumer(consumer, binding, self.use_json_encoding));

        Ok(())
    }

    /// Replaces the handle of the previous cycle, closing its channel so no
    /// stale consumer keeps delivering.
    fn install_handle(&self, handle: Arc<ChannelHandle>) {
        let previous = self
            .handles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.name().to_owned(), handle);

        if let Some(old) = previous {
            old.set_health(ChannelHealth::Closed);
            let channel = old.channel();
            tokio::spawn(async move {
                if let Err(err) = channel.close(200, "superseded by reconnect").await {
                    debug!(error = err.to_string(), "previous channel already gone");
                }
            });
        }
    }

    pub(crate) fn mark_all_closed(&self) {
        for handle in self
            .handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            handle.set_health(ChannelHealth::Closed);
        }
        warn!("connection lost, all managed channels marked closed");
    }

    /// The handle of the channel marked as default, once created.
    pub fn default_handle(&self) -> Option<Arc<ChannelHandle>> {
        self.handle(&self.default_channel)
    }

    pub fn handle(&self, name: &str) -> Option<Arc<ChannelHandle>> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Handles watched by the backlog monitor: every channel except the
    /// default one.
    pub(crate) fn monitored_handles(&self) -> Vec<Arc<ChannelHandle>> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|h| h.name() != self.default_channel)
            .cloned()
            .collect()
    }

    pub fn default_channel_name(&self) -> &str {
        &self.default_channel
    }

    pub fn use_json_encoding(&self) -> bool {
        self.use_json_encoding
    }
}

async fn run_consumer(mut consumer: Consumer, binding: HandlerBinding, use_json_encoding: bool) {
    let tracer = global::tracer("amqp consumer");

    while let Some(result) = consumer.next().await {
        match result {
            Ok(delivery) => {
                if let Err(err) =
                    process_delivery(&tracer, &delivery, &binding, use_json_encoding).await
                {
                    error!(error = err.to_string(), "error consume msg");
                }
            }

            Err(err) => error!(error = err.to_string(), "errors consume msg"),
        }
    }

    debug!(queue = binding.route.queue, "consumer stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MockHandlerResolver;

    fn empty_table() -> Arc<DispatchTable> {
        Arc::new(DispatchTable::resolve(&[], &MockHandlerResolver::new()).unwrap())
    }

    #[test]
    fn spec_builder_applies_defaults() {
        let spec = ChannelSpec::new("events");

        assert_eq!(spec.name, "events");
        assert!(!spec.is_default);
        assert_eq!(spec.prefetch_count, 1);
        assert!(spec.exchanges.is_empty());
        assert!(spec.queues.is_empty());
        assert!(spec.bindings.is_empty());
    }

    #[test]
    fn manager_tracks_the_default_channel_name() {
        let manager = ChannelManager::new(
            vec![
                ChannelSpec::new("metrics"),
                ChannelSpec::new("main").default_channel().prefetch(8),
            ],
            empty_table(),
            &ConnectionConfig::default(),
            &PublishPolicy::default(),
        );

        assert_eq!(manager.default_channel_name(), "main");
        assert!(manager.default_handle().is_none());
        assert!(manager.monitored_handles().is_empty());
    }

    #[test]
    fn pending_guard_releases_its_slot_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));

        let first = PendingGuard::new(counter.clone());
        let second = PendingGuard::new(counter.clone());
        assert_eq!(counter.load(Ordering::Relaxed), 2);

        drop(first);
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        drop(second);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
