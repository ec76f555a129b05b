//! Rate limit rules configuration and indexing.
//!
//! Rules are loaded once at startup from a YAML file and indexed by the
//! [`RuleKey`] of their own (domain, descriptors) pair. Matching is exact: an
//! identity only picks up a rule whose domain and full descriptor set are
//! identical to its own.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use super::descriptor::{Descriptors, RuleKey};
use crate::error::{RatekeeperError, Result};

/// Window length used when a rule names a unit we do not recognize.
const FALLBACK_UNIT_SECS: u64 = 60;

/// Time unit for rate limits.
///
/// Unknown unit strings are preserved in [`TimeUnit::Other`] and resolve to a
/// 60 second window instead of failing the load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Other(String),
}

impl TimeUnit {
    /// Length of one window of this unit, in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3600,
            TimeUnit::Day => 86400,
            TimeUnit::Other(_) => FALLBACK_UNIT_SECS,
        }
    }

    /// Length of one window of this unit.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    /// Whether this unit was recognized when parsed.
    pub fn is_known(&self) -> bool {
        !matches!(self, TimeUnit::Other(_))
    }
}

impl From<String> for TimeUnit {
    fn from(unit: String) -> Self {
        match unit.as_str() {
            "second" => TimeUnit::Second,
            "minute" => TimeUnit::Minute,
            "hour" => TimeUnit::Hour,
            "day" => TimeUnit::Day,
            _ => TimeUnit::Other(unit),
        }
    }
}

impl From<TimeUnit> for String {
    fn from(unit: TimeUnit) -> Self {
        match unit {
            TimeUnit::Second => "second".to_string(),
            TimeUnit::Minute => "minute".to_string(),
            TimeUnit::Hour => "hour".to_string(),
            TimeUnit::Day => "day".to_string(),
            TimeUnit::Other(other) => other,
        }
    }
}

/// The quota a rule grants per window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// The window unit
    pub unit: TimeUnit,
    /// Number of requests admitted per window
    pub requests_per_unit: u64,
}

/// A single admission rule scoped to a domain and an exact descriptor set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// The logical namespace of the rule
    pub domain: String,
    /// Descriptor entries that must all match exactly
    #[serde(default)]
    pub descriptors: Descriptors,
    /// The quota applied to matching identities
    pub rate_limit: RateLimit,
    /// Optional name used in logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Rule {
    /// Create a rule without a name.
    pub fn new(domain: impl Into<String>, descriptors: Descriptors, rate_limit: RateLimit) -> Self {
        Self {
            domain: domain.into(),
            descriptors,
            rate_limit,
            name: None,
        }
    }

    /// The key this rule is indexed under.
    pub fn key(&self) -> RuleKey {
        RuleKey::resolve(&self.domain, &self.descriptors)
    }
}

/// The on-disk rule file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    /// Rules in file order
    #[serde(default)]
    pub rate_limits: Vec<Rule>,
}

impl RulesFile {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RulesFile = serde_yaml::from_str(yaml).map_err(|e| {
            RatekeeperError::Config(format!("Failed to parse rate limit rules: {}", e))
        })?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<()> {
        for rule in &self.rate_limits {
            if rule.rate_limit.requests_per_unit == 0 {
                return Err(RatekeeperError::Config(format!(
                    "rule for domain '{}' must allow at least one request per unit",
                    rule.domain
                )));
            }
            if let TimeUnit::Other(unit) = &rule.rate_limit.unit {
                warn!(
                    domain = %rule.domain,
                    unit = %unit,
                    fallback_secs = FALLBACK_UNIT_SECS,
                    "Unrecognized rate limit unit, using fallback window"
                );
            }
        }
        Ok(())
    }
}

/// How to treat two rules with the same (domain, descriptors) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// The rule appearing later replaces the earlier one.
    #[default]
    LastWins,
    /// Duplicates are a configuration error.
    Reject,
}

/// Immutable index of rules by [`RuleKey`].
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: HashMap<RuleKey, Rule>,
}

impl RuleSet {
    /// Index rules, letting later duplicates replace earlier ones.
    pub fn new(rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut index = HashMap::new();
        for rule in rules {
            let key = rule.key();
            if let Some(previous) = index.insert(key.clone(), rule) {
                warn!(
                    key = %key,
                    domain = %previous.domain,
                    "Duplicate rate limit rule replaced by a later definition"
                );
            }
        }
        Self { rules: index }
    }

    /// Index rules under the given duplicate policy.
    pub fn with_policy(rules: impl IntoIterator<Item = Rule>, policy: DuplicatePolicy) -> Result<Self> {
        match policy {
            DuplicatePolicy::LastWins => Ok(Self::new(rules)),
            DuplicatePolicy::Reject => {
                let mut index = HashMap::new();
                for rule in rules {
                    let key = rule.key();
                    if index.contains_key(&key) {
                        return Err(RatekeeperError::Config(format!(
                            "duplicate rate limit rule for domain '{}' with descriptors {:?}",
                            rule.domain, rule.descriptors
                        )));
                    }
                    index.insert(key, rule);
                }
                Ok(Self { rules: index })
            }
        }
    }

    /// Find the rule configured for a key.
    pub fn lookup(&self, key: &RuleKey) -> Option<&Rule> {
        self.rules.get(key)
    }

    /// Number of indexed rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterate over indexed rules in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&RuleKey, &Rule)> {
        self.rules.iter()
    }
}

impl From<RulesFile> for RuleSet {
    fn from(file: RulesFile) -> Self {
        RuleSet::new(file.rate_limits)
    }
}
