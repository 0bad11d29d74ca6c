//! Retention for the event log.
//!
//! Cleanup piggybacks on admitted writes: each write rolls a die and, with a
//! small probability, deletes everything older than twice the longest
//! configured window. An optional timer-driven sweep covers deployments
//! whose traffic is too sparse for the write-triggered path.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::clock::Clock;
use super::policy::PolicyRegistry;
use crate::error::Result;
use crate::store::EventStore;

/// Default chance that an admitted write triggers a cleanup.
pub const DEFAULT_CLEANUP_PROBABILITY: f64 = 0.01;

/// Events are kept for this many multiples of the longest window.
const RETENTION_MULTIPLIER: i64 = 2;

/// Probabilistic cleanup of expired events.
#[derive(Debug, Clone, Copy)]
pub struct Reaper {
    probability: f64,
}

impl Reaper {
    /// Create a reaper firing with `probability` per admitted write.
    ///
    /// Values outside `0.0..=1.0` are clamped; NaN disables it.
    pub fn new(probability: f64) -> Self {
        let probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        Self { probability }
    }

    /// A reaper that never fires on writes.
    pub fn disabled() -> Self {
        Self { probability: 0.0 }
    }

    /// The per-write trigger probability.
    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Oldest timestamp that must survive a cleanup at `now`.
    pub fn retention_cutoff(policies: &PolicyRegistry, now: i64) -> i64 {
        let max_window = i64::try_from(policies.max_window_seconds()).unwrap_or(i64::MAX / 4);
        now.saturating_sub(max_window.saturating_mul(RETENTION_MULTIPLIER))
    }

    fn roll(&self) -> bool {
        self.probability > 0.0 && rand::thread_rng().gen_bool(self.probability)
    }

    /// Roll the die and, if it comes up, clean up on a spawned task.
    ///
    /// The caller never waits for the cleanup. Failures are logged by the
    /// task. Returns the task handle when a cleanup was started.
    pub fn maybe_spawn_clean(
        &self,
        store: Arc<dyn EventStore>,
        policies: Arc<PolicyRegistry>,
        now: i64,
    ) -> Option<JoinHandle<()>> {
        if !self.roll() {
            return None;
        }

        Some(tokio::spawn(async move {
            if let Err(e) = Self::clean(store.as_ref(), &policies, now).await {
                error!(error = %e, "Rate limit cleanup failed");
            }
        }))
    }

    /// Delete every event older than the retention cutoff.
    pub async fn clean(store: &dyn EventStore, policies: &PolicyRegistry, now: i64) -> Result<u64> {
        let cutoff = Self::retention_cutoff(policies, now);
        let deleted = store.delete_before(cutoff).await?;

        if deleted > 0 {
            info!(deleted, cutoff, "Cleaned up old rate limit records");
        } else {
            debug!(cutoff, "No expired rate limit records");
        }
        Ok(deleted)
    }

    /// Run a cleanup every `interval` until the returned task is aborted.
    pub fn spawn_sweeper(
        store: Arc<dyn EventStore>,
        policies: Arc<PolicyRegistry>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> JoinHandle<()> {
        info!(interval_secs = interval.as_secs(), "Starting scheduled rate limit sweep");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = Self::clean(store.as_ref(), &policies, clock.now()).await {
                    error!(error = %e, "Scheduled rate limit sweep failed");
                }
            }
        })
    }
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new(DEFAULT_CLEANUP_PROBABILITY)
    }
}
