//! Bounded, expiring per-type lists of recently processed events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

use crate::fault::{FaultInjector, InjectedFault};
use crate::metrics_consts::CACHE_WRITES;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryListCache;
pub use self::redis::RedisListCache;

pub const CACHE_OPERATION: &str = "cache_event_summary";
pub const RECENT_EVENTS_KEY_PREFIX: &str = "recent_events:";
pub const MAX_RECENT_EVENTS: usize = 100;
pub const RECENT_EVENTS_TTL: Duration = Duration::from_secs(3600);

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("failed to encode cache entry: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Injected(#[from] InjectedFault),
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentActivityEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Map<String, Value>,
}

pub fn recent_events_key(event_type: &str) -> String {
    format!("{RECENT_EVENTS_KEY_PREFIX}{event_type}")
}

/// List primitives over a keyed store. Indices follow Redis semantics: inclusive, and
/// negative values count from the tail.
#[async_trait]
pub trait ListCache: Send + Sync {
    async fn push(&self, key: &str, value: String) -> Result<(), CacheError>;

    async fn trim(&self, key: &str, start: isize, stop: isize) -> Result<(), CacheError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn range(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, CacheError>;

    /// Push to the head, keep at most `max_entries`, reset the expiry.
    async fn record(
        &self,
        key: &str,
        value: String,
        max_entries: usize,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.push(key, value).await?;
        self.trim(key, 0, max_entries as isize - 1).await?;
        self.expire(key, ttl).await
    }
}

#[derive(Clone)]
pub struct RecentActivityCache {
    backend: Arc<dyn ListCache>,
    injector: FaultInjector,
}

impl RecentActivityCache {
    pub fn new(backend: Arc<dyn ListCache>, injector: FaultInjector) -> Self {
        Self { backend, injector }
    }

    /// Records a summary of a processed event. Failures are logged and returned for the
    /// caller to count; they never affect the event itself.
    pub async fn record_summary(
        &self,
        event_type: &str,
        data: &Map<String, Value>,
    ) -> Result<(), CacheError> {
        let span = info_span!(
            "cache_event_summary",
            cache.key = %recent_events_key(event_type),
            otel.status_code = tracing::field::Empty,
        );

        let result = async {
            self.injector.maybe_inject_failure(CACHE_OPERATION).await?;

            let entry = RecentActivityEntry {
                timestamp: Utc::now(),
                event_type: event_type.to_string(),
                data: data.clone(),
            };
            let value = serde_json::to_string(&entry)?;
            self.backend
                .record(
                    &recent_events_key(event_type),
                    value,
                    MAX_RECENT_EVENTS,
                    RECENT_EVENTS_TTL,
                )
                .await
        }
        .instrument(span.clone())
        .await;

        match &result {
            Ok(()) => {
                debug!(event_type, "Event summary cached");
                metrics::counter!(CACHE_WRITES, "status" => "ok").increment(1);
            }
            Err(e) => {
                span.record("otel.status_code", "ERROR");
                warn!(event_type, error = %e, "Failed to cache event summary");
                metrics::counter!(CACHE_WRITES, "status" => "error").increment(1);
            }
        }

        result
    }

    /// Cached entries for `event_type`, newest first. Entries that no longer parse are skipped.
    pub async fn recent(&self, event_type: &str) -> Result<Vec<RecentActivityEntry>, CacheError> {
        let raw = self
            .backend
            .range(&recent_events_key(event_type), 0, -1)
            .await?;

        Ok(raw
            .iter()
            .filter_map(|value| match serde_json::from_str(value) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(event_type, error = %e, "Skipping unreadable cache entry");
                    None
                }
            })
            .collect())
    }
}
