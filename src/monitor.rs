// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Backlog Monitor
//!
//! Periodic sweep over the non-default managed channels reporting any with
//! outbound messages still in flight. Purely observational: the monitor never
//! mutates channel state, it only emits a warning per affected channel per
//! sweep. It runs for the process lifetime once spawned.

use crate::channel::ChannelManager;
use std::sync::Arc;
use tokio::{
    task::JoinHandle,
    time::{interval, Duration},
};
use tracing::warn;

/// Watches the unsent-message depth of every non-default channel.
pub struct BacklogMonitor {
    interval: Duration,
}

impl Default for BacklogMonitor {
    fn default() -> Self {
        BacklogMonitor {
            interval: Duration::from_secs(2),
        }
    }
}

impl BacklogMonitor {
    pub fn new(interval: Duration) -> BacklogMonitor {
        BacklogMonitor { interval }
    }

    /// Spawns the sweep task.
    pub fn spawn(&self, manager: Arc<ChannelManager>) -> JoinHandle<()> {
        let mut ticker = interval(self.interval);

        tokio::spawn(async move {
            loop {
                ticker.tick().await;

                let channels = manager
                    .monitored_handles()
                    .iter()
                    .map(|h| (h.name().to_owned(), h.pending_outbound()))
                    .collect::<Vec<_>>();

                for (channel, pending) in
                    backlogged(channels.iter().map(|(n, p)| (n.as_str(), *p)))
                {
                    warn!(
                        channel = channel,
                        pending = pending,
                        "channel has outbound messages pending"
                    );
                }
            }
        })
    }
}

/// The channels a sweep must warn about: those with a non-empty backlog.
fn backlogged<'a>(channels: impl Iterator<Item = (&'a str, usize)>) -> Vec<(&'a str, usize)> {
    channels.filter(|(_, pending)| *pending > 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warns_only_about_channels_with_a_backlog() {
        let channels = vec![("events", 5usize), ("metrics", 0usize)];

        let report = backlogged(channels.into_iter());

        assert_eq!(report, vec![("events", 5)]);
    }

    #[test]
    fn an_idle_sweep_reports_nothing() {
        let channels = vec![("events", 0usize), ("metrics", 0usize)];
        assert!(backlogged(channels.into_iter()).is_empty());
    }
}
