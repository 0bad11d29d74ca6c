//! Persisted event log behind the admission engine.
//!
//! Every admitted request appends one immutable [`RateLimitEvent`]. Windowed
//! counts are always derived from the log, never kept as separate counters.

mod memory;
mod redis_store;

pub use memory::MemoryEventStore;
pub use redis_store::{RedisEventStore, DEFAULT_KEY_PREFIX};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::Result;

/// One admitted request. Never mutated; deleted only by the reaper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitEvent {
    pub identifier: String,
    pub action: String,
    /// Unix seconds
    pub timestamp: i64,
    pub source_ip: String,
    pub user_agent: String,
    pub endpoint: String,
    pub method: String,
}

impl RateLimitEvent {
    /// An event carrying only the key fields, for callers without request
    /// metadata.
    pub fn bare(identifier: &str, action: &str, timestamp: i64) -> Self {
        Self {
            identifier: identifier.to_string(),
            action: action.to_string(),
            timestamp,
            source_ip: String::new(),
            user_agent: String::new(),
            endpoint: String::new(),
            method: String::new(),
        }
    }
}

/// Result of a window query for one identifier/action pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCount {
    /// Events with `timestamp > after`
    pub count: u64,
    /// Timestamp of the oldest of those events
    pub oldest: Option<i64>,
}

/// Per-action traffic summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStatistics {
    pub action: String,
    pub total_requests: u64,
    pub unique_clients: u64,
    pub unique_ips: u64,
}

/// Append/query interface over a durable event log.
///
/// Implementations must tolerate concurrent calls from many request tasks.
/// No call needs to be atomic with any other.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event.
    async fn append(&self, event: RateLimitEvent) -> Result<()>;

    /// Count events for `identifier`/`action` with `timestamp > after`.
    async fn count_events(&self, identifier: &str, action: &str, after: i64) -> Result<WindowCount>;

    /// Delete every event with `timestamp < cutoff`, returning how many went.
    async fn delete_before(&self, cutoff: i64) -> Result<u64>;

    /// Summaries of events with `timestamp > after`, busiest action first.
    async fn statistics(&self, after: i64) -> Result<Vec<ActionStatistics>>;
}

/// Folds events into per-action statistics.
#[derive(Debug, Default)]
pub(crate) struct StatisticsBuilder {
    actions: HashMap<String, ActionTally>,
}

#[derive(Debug, Default)]
struct ActionTally {
    total: u64,
    clients: HashSet<String>,
    ips: HashSet<String>,
}

impl StatisticsBuilder {
    pub(crate) fn add(&mut self, event: &RateLimitEvent) {
        let tally = self.actions.entry(event.action.clone()).or_default();
        tally.total += 1;
        tally.clients.insert(event.identifier.clone());
        if !event.source_ip.is_empty() {
            tally.ips.insert(event.source_ip.clone());
        }
    }

    pub(crate) fn build(self) -> Vec<ActionStatistics> {
        let mut stats: Vec<ActionStatistics> = self
            .actions
            .into_iter()
            .map(|(action, tally)| ActionStatistics {
                action,
                total_requests: tally.total,
                unique_clients: tally.clients.len() as u64,
                unique_ips: tally.ips.len() as u64,
            })
            .collect();

        stats.sort_by(|a, b| {
            b.total_requests
                .cmp(&a.total_requests)
                .then_with(|| a.action.cmp(&b.action))
        });
        stats
    }
}
