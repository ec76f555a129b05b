//! Quota state storage.
//!
//! The engine keeps one [`ConsumptionRecord`] per rule key in an expiring
//! key-value store. Entries vanish once their time-to-live passes, and a read
//! after expiry looks exactly like a read of a key that was never written.

use dashmap::DashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::descriptor::RuleKey;

/// Default number of entries the in-memory store holds before evicting.
pub const DEFAULT_STORE_CAPACITY: usize = 100_000;

const RECORD_LEN: usize = 16;

/// Errors raised by a quota store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A stored value could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Per-key consumption state for the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionRecord {
    /// Tokens left in the current window
    pub tokens_remaining: u64,
    /// Unix second the current window started
    pub window_start_unix: i64,
}

impl ConsumptionRecord {
    /// A full bucket whose window starts at `now`.
    pub fn full(tokens: u64, now: i64) -> Self {
        Self {
            tokens_remaining: tokens,
            window_start_unix: now,
        }
    }

    /// Encode as 16 big-endian bytes: tokens, then window start.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[..8].copy_from_slice(&self.tokens_remaining.to_be_bytes());
        buf[8..].copy_from_slice(&self.window_start_unix.to_be_bytes());
        buf
    }

    /// Decode the representation produced by [`ConsumptionRecord::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let buf: [u8; RECORD_LEN] = bytes.try_into().map_err(|_| {
            StoreError::Corrupt(format!("expected {} bytes, got {}", RECORD_LEN, bytes.len()))
        })?;

        let mut tokens = [0u8; 8];
        let mut start = [0u8; 8];
        tokens.copy_from_slice(&buf[..8]);
        start.copy_from_slice(&buf[8..]);

        Ok(Self {
            tokens_remaining: u64::from_be_bytes(tokens),
            window_start_unix: i64::from_be_bytes(start),
        })
    }
}

/// Port for the expiring store holding consumption records.
pub trait QuotaStore: Send + Sync + Debug {
    /// Read the record for a key, `None` if absent or expired.
    fn get(&self, key: &RuleKey) -> Result<Option<ConsumptionRecord>, StoreError>;

    /// Write the record for a key, replacing any previous value and
    /// resetting its time-to-live.
    fn set(&self, key: &RuleKey, record: ConsumptionRecord, ttl: Duration) -> Result<(), StoreError>;
}

impl<T: QuotaStore + ?Sized> QuotaStore for Arc<T> {
    fn get(&self, key: &RuleKey) -> Result<Option<ConsumptionRecord>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &RuleKey, record: ConsumptionRecord, ttl: Duration) -> Result<(), StoreError> {
        (**self).set(key, record, ttl)
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    expires_at: i64,
}

impl StoredEntry {
    fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// In-process expiring store backed by DashMap.
///
/// Holds at most `capacity` entries. Inserting a new key into a full store
/// first drops expired entries and then, if still full, evicts the entry
/// closest to expiry.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store with the default capacity and the system clock.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STORE_CAPACITY)
    }

    /// Create a store bounded to `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemClock::new()))
    }

    /// Create a store that measures expiry with the given clock.
    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            clock,
        }
    }

    fn bucket_key(key: &RuleKey) -> String {
        format!("bucket:{}", key)
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_unix();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired quota records");
        }
        purged
    }

    /// Number of stored entries, including ones not yet purged after expiry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn make_room(&self) {
        if self.entries.len() < self.capacity {
            return;
        }
        self.purge_expired();
        if self.entries.len() < self.capacity {
            return;
        }

        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());
        if let Some(victim) = victim {
            trace!(key = %victim, "Evicting quota record to stay within capacity");
            self.entries.remove(&victim);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaStore for MemoryStore {
    fn get(&self, key: &RuleKey) -> Result<Option<ConsumptionRecord>, StoreError> {
        let bucket_key = Self::bucket_key(key);
        let now = self.clock.now_unix();

        // Clone out so the shard read guard is released before any removal.
        let stored = self.entries.get(&bucket_key).map(|entry| entry.value().clone());

        match stored {
            Some(entry) if !entry.is_expired(now) => ConsumptionRecord::decode(&entry.value).map(Some),
            Some(_) => {
                self.entries.remove_if(&bucket_key, |_, entry| entry.is_expired(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &RuleKey, record: ConsumptionRecord, ttl: Duration) -> Result<(), StoreError> {
        let bucket_key = Self::bucket_key(key);
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = self.clock.now_unix().saturating_add(ttl_secs);

        if !self.entries.contains_key(&bucket_key) {
            self.make_room();
        }

        self.entries.insert(
            bucket_key,
            StoredEntry {
                value: record.encode().to_vec(),
                expires_at,
            },
        );
        Ok(())
    }
}
