//! Sliding-window admission engine.
//!
//! Each check counts the caller's events inside the trailing window, decides,
//! and on admit appends one more event. Count and append are separate store
//! round-trips; concurrent checks for the same key may overshoot a quota by
//! the number of checks in flight.
//!
//! Store failures never reach the caller. The engine logs them and admits.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::clock::{Clock, SystemClock};
use super::policy::{normalize_action, Policy, PolicyRegistry};
use super::reaper::Reaper;
use crate::error::Result;
use crate::store::{ActionStatistics, EventStore, RateLimitEvent};

/// Request metadata recorded on admitted events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub source_ip: String,
    pub user_agent: String,
    /// Path plus query string
    pub endpoint: String,
    pub method: String,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub action: String,
    /// `max_requests` of the policy that was applied
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the window next frees capacity
    pub reset_at: i64,
    /// Seconds until `reset_at`; zero when admitted
    pub retry_after: u64,
    pub window_seconds: u64,
}

impl Decision {
    fn evaluate(action: &str, policy: Policy, count: u64, oldest: Option<i64>, now: i64) -> Self {
        let allowed = count < policy.max_requests;
        let window = window_secs(&policy);
        let reset_at = match oldest {
            Some(oldest) => oldest.saturating_add(window),
            None => now.saturating_add(window),
        };
        let retry_after = if allowed {
            0
        } else {
            u64::try_from(reset_at.saturating_sub(now)).unwrap_or(0).max(1)
        };

        Self {
            allowed,
            action: action.to_string(),
            limit: policy.max_requests,
            remaining: policy
                .max_requests
                .saturating_sub(count)
                .saturating_sub(u64::from(allowed)),
            reset_at,
            retry_after,
            window_seconds: policy.window_seconds,
        }
    }

    /// Best-effort admit used when the store could not be read.
    fn fail_open(action: &str, policy: Policy, now: i64) -> Self {
        Self {
            allowed: true,
            action: action.to_string(),
            limit: policy.max_requests,
            remaining: policy.max_requests.saturating_sub(1),
            reset_at: now.saturating_add(window_secs(&policy)),
            retry_after: 0,
            window_seconds: policy.window_seconds,
        }
    }
}

/// Read-only view of an identifier's consumption for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub count_in_window: u64,
    pub remaining: u64,
    pub reset_at: i64,
}

/// Decides whether requests are admitted under their action's policy.
///
/// Cheap to clone; clones share the store, registry and clock.
#[derive(Clone)]
pub struct AdmissionEngine {
    store: Arc<dyn EventStore>,
    policies: Arc<PolicyRegistry>,
    reaper: Reaper,
    clock: Arc<dyn Clock>,
}

impl AdmissionEngine {
    /// Create an engine over `store` with the system clock and default reaper.
    pub fn new(store: Arc<dyn EventStore>, policies: Arc<PolicyRegistry>) -> Self {
        Self {
            store,
            policies,
            reaper: Reaper::default(),
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_reaper(mut self, reaper: Reaper) -> Self {
        self.reaper = reaper;
        self
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Check `identifier` against `action` without request metadata.
    pub async fn admit(&self, identifier: &str, action: &str) -> Decision {
        self.admit_request(identifier, action, &RequestContext::default())
            .await
    }

    /// Check `identifier` against `action`, recording `context` on admit.
    ///
    /// A triggered cleanup runs on its own task; the caller only waits for
    /// the count and the append.
    pub async fn admit_request(
        &self,
        identifier: &str,
        action: &str,
        context: &RequestContext,
    ) -> Decision {
        let action = normalize_action(action);
        let action = action.as_ref();
        let policy = self.policies.get(action);
        let now = self.clock.now();
        let window_start = now.saturating_sub(window_secs(&policy));

        trace!(
            identifier = %identifier,
            action = %action,
            window_start,
            "Checking rate limit"
        );

        let window = match self
            .store
            .count_events(identifier, action, window_start)
            .await
        {
            Ok(window) => window,
            Err(e) => {
                error!(
                    identifier = %identifier,
                    action = %action,
                    error = %e,
                    "Rate limit check failed, admitting request"
                );
                return Decision::fail_open(action, policy, now);
            }
        };

        let decision = Decision::evaluate(action, policy, window.count, window.oldest, now);

        if !decision.allowed {
            warn!(
                identifier = %identifier,
                action = %action,
                count = window.count,
                limit = policy.max_requests,
                window_seconds = policy.window_seconds,
                "Rate limit exceeded"
            );
            return decision;
        }

        let event = RateLimitEvent {
            identifier: identifier.to_string(),
            action: action.to_string(),
            timestamp: now,
            source_ip: context.source_ip.clone(),
            user_agent: context.user_agent.clone(),
            endpoint: context.endpoint.clone(),
            method: context.method.clone(),
        };

        match self.store.append(event).await {
            Ok(()) => {
                self.reaper.maybe_spawn_clean(self.store.clone(), self.policies.clone(), now);
            }
            Err(e) => {
                error!(
                    identifier = %identifier,
                    action = %action,
                    error = %e,
                    "Failed to record rate limit event"
                );
            }
        }

        debug!(
            identifier = %identifier,
            action = %action,
            remaining = decision.remaining,
            reset_at = decision.reset_at,
            "Request admitted"
        );
        decision
    }

    /// Current consumption for `identifier` on `action`, without recording.
    ///
    /// A store failure reports a full quota.
    pub async fn usage(&self, identifier: &str, action: &str) -> Usage {
        let action = normalize_action(action);
        let action = action.as_ref();
        let policy = self.policies.get(action);
        let now = self.clock.now();
        let window = window_secs(&policy);

        let count = match self
            .store
            .count_events(identifier, action, now.saturating_sub(window))
            .await
        {
            Ok(w) => w.count,
            Err(e) => {
                error!(
                    identifier = %identifier,
                    action = %action,
                    error = %e,
                    "Rate limit usage lookup failed"
                );
                0
            }
        };

        Usage {
            count_in_window: count,
            remaining: policy.max_requests.saturating_sub(count),
            reset_at: now.saturating_add(window),
        }
    }

    /// Per-action traffic over the last `timeframe_secs` seconds.
    pub async fn statistics(&self, timeframe_secs: u64) -> Result<Vec<ActionStatistics>> {
        let timeframe = i64::try_from(timeframe_secs).unwrap_or(i64::MAX);
        let after = self.clock.now().saturating_sub(timeframe);
        self.store.statistics(after).await
    }

    pub fn get_limits(&self) -> BTreeMap<String, Policy> {
        self.policies.list()
    }

    /// Replace the policy for `action` while requests are in flight.
    pub fn update_limit(
        &self,
        action: &str,
        max_requests: u64,
        window_seconds: u64,
    ) -> Result<Policy> {
        self.policies.set(action, max_requests, window_seconds)
    }

    pub fn remove_limit(&self, action: &str) -> Result<Option<Policy>> {
        self.policies.remove(action)
    }

    /// Start the timer-driven reaper sweep alongside the per-write trigger.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        Reaper::spawn_sweeper(
            self.store.clone(),
            self.policies.clone(),
            self.clock.clone(),
            interval,
        )
    }
}

fn window_secs(policy: &Policy) -> i64 {
    i64::try_from(policy.window_seconds).unwrap_or(i64::MAX)
}
