//! Geocode result cache.
//!
//! Content-addressed by the canonical serialization of a normalized address.
//! Entries expire lazily: an entry older than the TTL reads as absent but
//! stays in memory until [`ResultCache::purge_expired`] runs (backends purge
//! on flush). Writes always overwrite.

pub mod file;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geocode::GeocodeResult;

/// 4 weeks.
pub const DEFAULT_TTL_DAYS: i64 = 28;

/// Bumped whenever the persisted layout changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: GeocodeResult,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCache {
    pub fn new() -> Self {
        Self::with_ttl(Duration::days(DEFAULT_TTL_DAYS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<&GeocodeResult> {
        self.get_at(key, Utc::now())
    }

    /// Lookup as of `now`; entries older than the TTL are absent.
    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<&GeocodeResult> {
        self.entries
            .get(key)
            .filter(|e| !self.is_expired(e, now))
            .map(|e| &e.value)
    }

    pub fn put(&mut self, key: impl Into<String>, value: GeocodeResult) {
        self.put_at(key, value, Utc::now());
    }

    pub fn put_at(&mut self, key: impl Into<String>, value: GeocodeResult, created_at: DateTime<Utc>) {
        self.entries
            .insert(key.into(), CacheEntry { value, created_at });
    }

    /// Entry count, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, e| now - e.created_at <= ttl);
        before - self.entries.len()
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.created_at > self.ttl
    }

    /// Persistable view with expired entries left out.
    pub fn snapshot(&self, now: DateTime<Utc>) -> CacheSnapshot {
        CacheSnapshot {
            version: CACHE_FORMAT_VERSION,
            entries: self
                .entries
                .iter()
                .filter(|(_, e)| !self.is_expired(e, now))
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: CacheSnapshot, ttl: Duration) -> Self {
        Self {
            entries: snapshot.entries,
            ttl,
        }
    }
}

/// On-disk / on-wire form of the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub version: u32,
    pub entries: HashMap<String, CacheEntry>,
}

/// Durable storage for the cache: loaded once at run start, flushed once at
/// run end.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn load(&self) -> Result<ResultCache>;
    async fn flush(&self, cache: &ResultCache) -> Result<()>;
    fn describe(&self) -> String;
}

/// Keeps the last flushed snapshot in memory.
pub struct MemoryBackend {
    ttl: Duration,
    stored: Mutex<Option<CacheSnapshot>>,
    flushes: Mutex<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_ttl(Duration::days(DEFAULT_TTL_DAYS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            stored: Mutex::new(None),
            flushes: Mutex::new(0),
        }
    }

    pub fn flush_count(&self) -> usize {
        *self.flushes.lock().expect("memory backend mutex poisoned")
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn load(&self) -> Result<ResultCache> {
        let stored = self
            .stored
            .lock()
            .expect("memory backend mutex poisoned")
            .clone();
        Ok(match stored {
            Some(s) => ResultCache::from_snapshot(s, self.ttl),
            None => ResultCache::with_ttl(self.ttl),
        })
    }

    async fn flush(&self, cache: &ResultCache) -> Result<()> {
        let snapshot = cache.snapshot(Utc::now());
        *self.stored.lock().expect("memory backend mutex poisoned") = Some(snapshot);
        *self.flushes.lock().expect("memory backend mutex poisoned") += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
