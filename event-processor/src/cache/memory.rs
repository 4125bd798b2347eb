use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::cache::{CacheError, ListCache};

#[derive(Default)]
struct Entry {
    items: VecDeque<String>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process list cache with lazy expiry.
#[derive(Default)]
pub struct MemoryListCache {
    lists: Mutex<HashMap<String, Entry>>,
    fail_writes: AtomicBool,
}

impl MemoryListCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut lists = match self.lists.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        lists.retain(|_, entry| !entry.is_expired(now));
        lists
    }

    fn check_writable(&self) -> Result<(), CacheError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }

    /// Makes every following write fail until switched back
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, |entry| entry.items.len())
    }

    /// Remaining time to live of `key`, if it exists and has an expiry
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

// Resolves a Redis-style inclusive index pair against a list of `len` items.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

#[async_trait]
impl ListCache for MemoryListCache {
    async fn push(&self, key: &str, value: String) -> Result<(), CacheError> {
        self.check_writable()?;
        self.lock()
            .entry(key.to_string())
            .or_default()
            .items
            .push_front(value);
        Ok(())
    }

    async fn trim(&self, key: &str, start: isize, stop: isize) -> Result<(), CacheError> {
        self.check_writable()?;
        let mut lists = self.lock();
        let Some(entry) = lists.get_mut(key) else {
            return Ok(());
        };

        match resolve_range(entry.items.len(), start, stop) {
            Some((start, stop)) => {
                entry.items.truncate(stop + 1);
                entry.items.drain(..start);
            }
            None => {
                lists.remove(key);
            }
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.check_writable()?;
        if let Some(entry) = self.lock().get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn record(
        &self,
        key: &str,
        value: String,
        max_entries: usize,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.check_writable()?;
        let mut lists = self.lock();
        let entry = lists.entry(key.to_string()).or_default();
        entry.items.push_front(value);
        entry.items.truncate(max_entries);
        if entry.items.is_empty() {
            lists.remove(key);
        } else {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CacheError> {
        let lists = self.lock();
        let Some(entry) = lists.get(key) else {
            return Ok(vec![]);
        };

        Ok(match resolve_range(entry.items.len(), start, stop) {
            Some((start, stop)) => entry.items.range(start..=stop).cloned().collect(),
            None => vec![],
        })
    }
}
