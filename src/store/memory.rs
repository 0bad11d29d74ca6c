//! In-process event store.
//!
//! Keeps the log in a sharded map keyed by identifier/action. Suitable for a
//! single node and for tests; nothing survives a restart.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{ActionStatistics, EventStore, RateLimitEvent, StatisticsBuilder, WindowCount};
use crate::error::Result;

type EventKey = (String, String);

/// Event log held in memory.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: DashMap<EventKey, Vec<RateLimitEvent>>,
}

impl MemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events.
    pub fn len(&self) -> usize {
        self.events.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether the store holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the events for one identifier/action pair.
    pub fn events_for(&self, identifier: &str, action: &str) -> Vec<RateLimitEvent> {
        self.events
            .get(&(identifier.to_string(), action.to_string()))
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: RateLimitEvent) -> Result<()> {
        let key = (event.identifier.clone(), event.action.clone());
        self.events.entry(key).or_default().push(event);
        Ok(())
    }

    async fn count_events(
        &self,
        identifier: &str,
        action: &str,
        after: i64,
    ) -> Result<WindowCount> {
        let key = (identifier.to_string(), action.to_string());
        let Some(entry) = self.events.get(&key) else {
            return Ok(WindowCount::default());
        };

        let window = entry.value().iter().filter(|e| e.timestamp > after);
        let (count, oldest) = window.fold((0u64, None::<i64>), |(count, oldest), e| {
            let oldest = Some(oldest.map_or(e.timestamp, |o| o.min(e.timestamp)));
            (count + 1, oldest)
        });

        Ok(WindowCount { count, oldest })
    }

    async fn delete_before(&self, cutoff: i64) -> Result<u64> {
        let mut deleted = 0u64;
        self.events.retain(|_, events| {
            let before = events.len();
            events.retain(|e| e.timestamp >= cutoff);
            deleted += (before - events.len()) as u64;
            !events.is_empty()
        });
        Ok(deleted)
    }

    async fn statistics(&self, after: i64) -> Result<Vec<ActionStatistics>> {
        let mut builder = StatisticsBuilder::default();
        for entry in self.events.iter() {
            for event in entry.value().iter().filter(|e| e.timestamp > after) {
                builder.add(event);
            }
        }
        Ok(builder.build())
    }
}
