// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Startup Liveness Validation
//!
//! Bounded-retry check that the supervised connection reaches the Connected
//! state within a time budget after startup. Failing the budget is the one
//! fault in this crate that escalates to a fatal startup error: a broker that
//! cannot be reached at all within the budget points at misconfiguration, not
//! a transient blip.

use crate::{errors::AmqpError, supervisor::ConnectionState};
use tokio::{
    sync::watch,
    time::{sleep, Duration},
};
use tracing::{debug, error, warn};

/// Periodically samples the connection state until it is Connected or the
/// check budget runs out.
pub struct LivenessValidator {
    checks_remaining: u32,
    interval: Duration,
}

impl Default for LivenessValidator {
    fn default() -> Self {
        LivenessValidator {
            checks_remaining: 6,
            interval: Duration::from_secs(1),
        }
    }
}

impl LivenessValidator {
    pub fn new(checks_remaining: u32, interval: Duration) -> LivenessValidator {
        LivenessValidator {
            checks_remaining: checks_remaining.max(1),
            interval,
        }
    }

    /// Runs the validation. The first check fires one interval after the
    /// call; the last one at `checks_remaining * interval`.
    pub async fn validate(
        &self,
        state: watch::Receiver<ConnectionState>,
    ) -> Result<(), AmqpError> {
        let mut remaining = self.checks_remaining;

        loop {
            sleep(self.interval).await;

            if *state.borrow() == ConnectionState::Connected {
                debug!("broker connection is up");
                return Ok(());
            }

            if remaining <= 1 {
                error!("broker unreachable within the startup liveness budget");
                return Err(AmqpError::LivenessTimeoutError);
            }

            remaining -= 1;
            warn!(
                checks_remaining = remaining,
                "broker not reachable yet, rescheduling liveness check"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn fails_after_the_budget_when_never_connected() {
        let (_tx, rx) = watch::channel(ConnectionState::Connecting);
        let started = Instant::now();

        let result = LivenessValidator::default().validate(rx).await;

        assert_eq!(result, Err(AmqpError::LivenessTimeoutError));
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_the_connection_comes_up() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);

        tokio::spawn(async move {
            sleep(Duration::from_millis(2_500)).await;
            tx.send_replace(ConnectionState::Connected);
        });

        let started = Instant::now();
        let result = LivenessValidator::default().validate(rx).await;

        assert_eq!(result, Ok(()));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_connection_passes_on_the_first_check() {
        let (_tx, rx) = watch::channel(ConnectionState::Connected);
        let started = Instant::now();

        let result = LivenessValidator::default().validate(rx).await;

        assert_eq!(result, Ok(()));
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }
}
