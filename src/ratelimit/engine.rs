//! The admission engine.
//!
//! Each check resolves the identity to a [`RuleKey`], looks up its rule, and
//! runs a fixed-window token bucket against the quota store. The
//! read-refill-consume-write sequence runs under a lock shard chosen by the
//! rule key, so two callers for the same key never interleave.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::descriptor::RuleKey;
use super::rules::RuleSet;
use super::store::{ConsumptionRecord, MemoryStore, QuotaStore, StoreError};
use crate::error::Result;

/// What the engine does when the quota store misbehaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Treat store failures as a missing record and keep admitting.
    #[default]
    Open,
    /// Surface store failures to the caller.
    Closed,
}

/// Tuning knobs for an [`AdmissionEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Number of lock shards; 1 serializes every check through one lock
    pub lock_shards: usize,
    /// Store failure handling
    pub failure_mode: FailureMode,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lock_shards: 1,
            failure_mode: FailureMode::Open,
        }
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No rule is configured for the identity.
    Unlimited,
    /// A token was consumed.
    Admitted {
        /// Tokens left in the current window
        remaining: u64,
    },
    /// The window's quota is exhausted.
    OverLimit {
        /// Time until the current window ends
        reset_after: Duration,
    },
}

impl Decision {
    /// Whether the unit of work may proceed.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Decision::OverLimit { .. })
    }
}

/// Admission engine owning a rule set and a handle to the quota store.
///
/// The engine is `Send + Sync` and is meant to be shared behind an `Arc`.
#[derive(Debug)]
pub struct AdmissionEngine<S: QuotaStore = MemoryStore> {
    rules: RuleSet,
    store: S,
    clock: Arc<dyn Clock>,
    locks: Box<[Mutex<()>]>,
    failure_mode: FailureMode,
}

impl<S: QuotaStore> AdmissionEngine<S> {
    /// Create an engine with the system clock and default options.
    pub fn new(rules: RuleSet, store: S) -> Self {
        Self::with_options(rules, store, Arc::new(SystemClock::new()), EngineOptions::default())
    }

    /// Create an engine with an explicit clock and options.
    pub fn with_options(
        rules: RuleSet,
        store: S,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
    ) -> Self {
        let locks = (0..options.lock_shards.max(1))
            .map(|_| Mutex::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            rules,
            store,
            clock,
            locks,
            failure_mode: options.failure_mode,
        }
    }

    /// Decide whether to admit one unit of work for an identity.
    ///
    /// Returns an error only under [`FailureMode::Closed`] when the store
    /// fails; an over-quota rejection is `Ok(Decision::OverLimit { .. })`.
    pub fn check<I, K, V>(&self, domain: &str, descriptors: I) -> Result<Decision>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let key = RuleKey::resolve(domain, descriptors);

        let Some(rule) = self.rules.lookup(&key) else {
            trace!(domain = %domain, key = %key, "No rate limit rule configured");
            return Ok(Decision::Unlimited);
        };

        let limit = rule.rate_limit.requests_per_unit;
        let window = rule.rate_limit.unit.duration();
        let window_secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);

        let _guard = self.locks[key.shard(self.locks.len())].lock();

        let now = self.clock.now_unix();
        let mut record = self
            .read_record(&key)?
            .unwrap_or_else(|| ConsumptionRecord::full(limit, now));

        if now.saturating_sub(record.window_start_unix) >= window_secs {
            trace!(key = %key, "Window elapsed, refilling bucket");
            record = ConsumptionRecord::full(limit, now);
        }
        record.tokens_remaining = record.tokens_remaining.min(limit);

        let decision = if record.tokens_remaining > 0 {
            record.tokens_remaining -= 1;
            Decision::Admitted {
                remaining: record.tokens_remaining,
            }
        } else {
            let window_end = record.window_start_unix.saturating_add(window_secs);
            let reset_after = Duration::from_secs(window_end.saturating_sub(now).max(0) as u64);
            debug!(
                domain = %domain,
                key = %key,
                rule = rule.name.as_deref().unwrap_or(""),
                limit = limit,
                reset_after_secs = reset_after.as_secs(),
                "Rate limit exceeded"
            );
            Decision::OverLimit { reset_after }
        };

        self.write_record(&key, record, window)?;

        Ok(decision)
    }

    /// Boolean form of [`AdmissionEngine::check`].
    pub fn allow<I, K, V>(&self, domain: &str, descriptors: I) -> Result<bool>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.check(domain, descriptors).map(|decision| decision.is_admitted())
    }

    fn read_record(&self, key: &RuleKey) -> Result<Option<ConsumptionRecord>> {
        match self.store.get(key) {
            Ok(record) => Ok(record),
            Err(StoreError::Corrupt(reason)) => {
                warn!(key = %key, reason = %reason, "Discarding corrupt quota record");
                Ok(None)
            }
            Err(err) => match self.failure_mode {
                FailureMode::Open => {
                    warn!(key = %key, error = %err, "Quota store read failed, treating as empty");
                    Ok(None)
                }
                FailureMode::Closed => Err(err.into()),
            },
        }
    }

    fn write_record(&self, key: &RuleKey, record: ConsumptionRecord, ttl: Duration) -> Result<()> {
        match self.store.set(key, record, ttl) {
            Ok(()) => Ok(()),
            Err(err) => match self.failure_mode {
                FailureMode::Open => {
                    warn!(key = %key, error = %err, "Quota store write failed, decision kept");
                    Ok(())
                }
                FailureMode::Closed => Err(err.into()),
            },
        }
    }

    /// The indexed rules.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// The quota store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Store failure handling in effect.
    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    /// Number of lock shards.
    pub fn lock_shards(&self) -> usize {
        self.locks.len()
    }
}
