//! Redis-backed event store.
//!
//! Layout:
//! - `{prefix}:events:{len}:{identifier}:{action}` is a sorted set of
//!   serialized events scored by their unix timestamp, so a window count is a
//!   single `ZCOUNT` over `(window_start, +inf)`. `len` is the byte length of
//!   the identifier, which keeps the key unambiguous when either part
//!   contains `:`.
//! - `{prefix}:keys` is a set naming every event key, walked with `SSCAN` by
//!   the reaper and by statistics.
//!
//! Each member carries a random id so that identical events at the same
//! second are stored, and counted, separately.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ActionStatistics, EventStore, RateLimitEvent, StatisticsBuilder, WindowCount};
use crate::error::{Result, TollgateError};

/// Key prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "tollgate";

/// Registry members requested per `SSCAN` page.
const SCAN_BATCH: usize = 256;

/// Trims one event key and unregisters it once empty, atomically.
const TRIM_SCRIPT: &str = r#"
local removed = redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", "(" .. ARGV[1])
if redis.call("ZCARD", KEYS[1]) == 0 then
    redis.call("SREM", KEYS[2], KEYS[1])
end
return removed
"#;

#[derive(Debug, Serialize, Deserialize)]
struct StoredEvent {
    id: Uuid,
    #[serde(flatten)]
    event: RateLimitEvent,
}

/// Durable event log in Redis, shared by every process pointing at it.
#[derive(Clone)]
pub struct RedisEventStore {
    connection: ConnectionManager,
    key_prefix: String,
}

impl fmt::Debug for RedisEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEventStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisEventStore {
    /// Connect to Redis at `url`, namespacing keys under `key_prefix`.
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        if key_prefix.is_empty() {
            return Err(TollgateError::Config(
                "redis key prefix must not be empty".to_string(),
            ));
        }

        let client = Client::open(url)?;
        let connection = client.get_connection_manager().await?;

        info!(key_prefix = %key_prefix, "Connected to Redis event store");
        Ok(Self::from_connection_manager(connection, key_prefix))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection_manager(connection: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            connection,
            key_prefix: key_prefix.to_string(),
        }
    }

    fn events_key(&self, identifier: &str, action: &str) -> String {
        events_key(&self.key_prefix, identifier, action)
    }

    fn registry_key(&self) -> String {
        format!("{}:keys", self.key_prefix)
    }

    /// One `SSCAN` page of the key registry; a returned cursor of 0 ends
    /// the walk. Pages may repeat members.
    async fn scan_registry(&self, cursor: u64) -> Result<(u64, Vec<String>)> {
        let mut conn = self.connection.clone();
        let page: (u64, Vec<String>) = redis::cmd("SSCAN")
            .arg(self.registry_key())
            .arg(cursor)
            .arg("COUNT")
            .arg(SCAN_BATCH)
            .query_async(&mut conn)
            .await?;
        Ok(page)
    }

    async fn registered_keys(&self) -> Result<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        let mut cursor = 0;
        loop {
            let (next, page) = self.scan_registry(cursor).await?;
            keys.extend(page);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

fn events_key(prefix: &str, identifier: &str, action: &str) -> String {
    format!(
        "{}:events:{}:{}:{}",
        prefix,
        identifier.len(),
        identifier,
        action
    )
}

#[async_trait]
impl EventStore for RedisEventStore {
    async fn append(&self, event: RateLimitEvent) -> Result<()> {
        let key = self.events_key(&event.identifier, &event.action);
        let timestamp = event.timestamp;
        let member = serde_json::to_string(&StoredEvent {
            id: Uuid::new_v4(),
            event,
        })
        .map_err(|e| TollgateError::Persistence(format!("failed to encode event: {}", e)))?;

        let mut conn = self.connection.clone();
        let _: () = redis::pipe()
            .atomic()
            .zadd(&key, member, timestamp)
            .ignore()
            .sadd(self.registry_key(), &key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn count_events(
        &self,
        identifier: &str,
        action: &str,
        after: i64,
    ) -> Result<WindowCount> {
        let key = self.events_key(identifier, action);
        let min = format!("({}", after);

        let mut conn = self.connection.clone();
        let (count, oldest): (u64, Vec<(String, f64)>) = redis::pipe()
            .zcount(&key, &min, "+inf")
            .zrangebyscore_limit_withscores(&key, &min, "+inf", 0, 1)
            .query_async(&mut conn)
            .await?;

        Ok(WindowCount {
            count,
            oldest: oldest.first().map(|(_, score)| *score as i64),
        })
    }

    async fn delete_before(&self, cutoff: i64) -> Result<u64> {
        let registry = self.registry_key();
        let mut conn = self.connection.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(TRIM_SCRIPT)
            .query_async(&mut conn)
            .await?;

        let mut deleted = 0u64;
        let mut pages = 0u64;
        let mut cursor = 0;
        loop {
            let (next, keys) = self.scan_registry(cursor).await?;
            if !keys.is_empty() {
                let mut pipe = redis::pipe();
                for key in &keys {
                    pipe.cmd("EVALSHA")
                        .arg(&sha)
                        .arg(2)
                        .arg(key)
                        .arg(&registry)
                        .arg(cutoff);
                }
                let removed: Vec<u64> = pipe.query_async(&mut conn).await?;
                deleted += removed.iter().sum::<u64>();
            }

            pages += 1;
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(cutoff, deleted, pages, "Trimmed Redis event keys");
        Ok(deleted)
    }

    async fn statistics(&self, after: i64) -> Result<Vec<ActionStatistics>> {
        let min = format!("({}", after);
        let mut conn = self.connection.clone();
        let mut builder = StatisticsBuilder::default();

        for key in self.registered_keys().await? {
            let members: Vec<String> = conn.zrangebyscore(&key, &min, "+inf").await?;
            for member in members {
                match serde_json::from_str::<StoredEvent>(&member) {
                    Ok(stored) => builder.add(&stored.event),
                    Err(e) => warn!(key = %key, error = %e, "Skipping undecodable event"),
                }
            }
        }

        Ok(builder.build())
    }
}
