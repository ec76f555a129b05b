//! Admission service: maps wire requests onto engine decisions.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::error::Result;
use crate::ratelimit::{AdmissionEngine, Decision, Descriptors, QuotaStore};

/// Domain used when a request does not name one.
pub const DEFAULT_DOMAIN: &str = "default";

/// A single admission check request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// The domain to check; empty means [`DEFAULT_DOMAIN`]
    #[serde(default)]
    pub domain: String,
    /// Descriptor entries qualifying the domain
    #[serde(default)]
    pub descriptors: Descriptors,
}

/// The answer to an [`AdmissionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionResponse {
    /// Admitted; `remaining` is absent when no rule applies.
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remaining: Option<u64>,
    },
    /// Rejected for exceeding the quota.
    OverLimit { reset_after_secs: u64 },
    /// The request could not be evaluated.
    Error { message: String },
}

impl From<Decision> for AdmissionResponse {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Unlimited => AdmissionResponse::Ok { remaining: None },
            Decision::Admitted { remaining } => AdmissionResponse::Ok {
                remaining: Some(remaining),
            },
            Decision::OverLimit { reset_after } => AdmissionResponse::OverLimit {
                reset_after_secs: reset_after.as_secs(),
            },
        }
    }
}

/// Transport-independent admission service.
pub struct AdmissionService<S: QuotaStore> {
    /// The admission engine
    engine: Arc<AdmissionEngine<S>>,
}

impl<S: QuotaStore> AdmissionService<S> {
    /// Create a new service over a shared engine.
    pub fn new(engine: Arc<AdmissionEngine<S>>) -> Self {
        Self { engine }
    }

    /// Evaluate one request.
    #[instrument(
        skip(self, request),
        fields(
            domain = %request.domain,
            descriptor_count = request.descriptors.len()
        )
    )]
    pub fn handle(&self, request: AdmissionRequest) -> AdmissionResponse {
        let domain = if request.domain.is_empty() {
            DEFAULT_DOMAIN
        } else {
            request.domain.as_str()
        };

        match self.engine.check(domain, &request.descriptors) {
            Ok(decision) => {
                debug!(decision = ?decision, "Admission decision made");
                decision.into()
            }
            Err(e) => {
                warn!(error = %e, "Admission check failed");
                AdmissionResponse::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    /// Evaluate one JSON-encoded request and encode the response.
    ///
    /// Malformed requests produce an `ERROR` response rather than a failure.
    pub fn handle_line(&self, line: &str) -> Result<String> {
        let response = match serde_json::from_str::<AdmissionRequest>(line) {
            Ok(request) => self.handle(request),
            Err(e) => {
                warn!(error = %e, "Received malformed admission request");
                AdmissionResponse::Error {
                    message: format!("malformed request: {}", e),
                }
            }
        };

        Ok(serde_json::to_string(&response)?)
    }
}

impl<S: QuotaStore> Clone for AdmissionService<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}
