//! Admission control: rule indexing, quota state, and the admission decision.

mod clock;
mod descriptor;
mod engine;
mod rules;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use descriptor::{Descriptors, RuleKey};
pub use engine::{AdmissionEngine, Decision, EngineOptions, FailureMode};
pub use rules::{DuplicatePolicy, RateLimit, Rule, RuleSet, RulesFile, TimeUnit};
pub use store::{ConsumptionRecord, MemoryStore, QuotaStore, StoreError, DEFAULT_STORE_CAPACITY};
