//! HTTP admission middleware.
//!
//! The caller identity travels in request headers:
//!
//! ```text
//! X-RateLimit-Domain: checkout
//! X-RateLimit-Desc-Tier: free
//! ```
//!
//! becomes domain `checkout` with descriptors `{tier: free}`. Header names are
//! case-insensitive, so descriptor keys are always the lowercased suffix.

use axum::extract::{Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::service::DEFAULT_DOMAIN;
use crate::error::Result;
use crate::ratelimit::{AdmissionEngine, Decision, Descriptors, QuotaStore};

/// Header naming the domain to check.
pub const DOMAIN_HEADER: &str = "x-ratelimit-domain";

/// Prefix of headers carrying descriptor entries.
pub const DESCRIPTOR_HEADER_PREFIX: &str = "x-ratelimit-desc-";

/// Extract the (domain, descriptors) identity from request headers.
///
/// Only the first value of a repeated header is used. Values that are not
/// visible ASCII are skipped.
pub fn identity_from_headers(headers: &HeaderMap) -> (String, Descriptors) {
    let domain = headers
        .get(DOMAIN_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|domain| !domain.is_empty())
        .unwrap_or(DEFAULT_DOMAIN)
        .to_string();

    let mut descriptors = Descriptors::new();
    for name in headers.keys() {
        let Some(key) = name.as_str().strip_prefix(DESCRIPTOR_HEADER_PREFIX) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        if let Some(value) = headers.get(name).and_then(|value| value.to_str().ok()) {
            descriptors.insert(key.to_string(), value.to_string());
        }
    }

    (domain, descriptors)
}

/// Admission middleware for axum routers.
///
/// Over-limit requests get `429 Too Many Requests` with a `Retry-After`
/// header. A fail-closed engine that cannot evaluate answers
/// `503 Service Unavailable`.
pub async fn admission_middleware<S: QuotaStore + 'static>(
    State(engine): State<Arc<AdmissionEngine<S>>>,
    req: Request,
    next: Next,
) -> Response {
    let (domain, descriptors) = identity_from_headers(req.headers());

    match engine.check(&domain, &descriptors) {
        Ok(Decision::OverLimit { reset_after }) => {
            debug!(domain = %domain, "Rejecting over-limit HTTP request");
            too_many_requests(reset_after)
        }
        Ok(_) => next.run(req).await,
        Err(e) => {
            warn!(domain = %domain, error = %e, "Admission check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "503 - Admission Check Failed").into_response()
        }
    }
}

fn too_many_requests(reset_after: Duration) -> Response {
    let retry_after = reset_after.as_secs().max(1);
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(RETRY_AFTER, retry_after.to_string())],
        "429 - Too Many Requests",
    )
        .into_response()
}

/// Guard every route of `router` with the admission engine.
pub fn with_admission<S: QuotaStore + 'static>(
    router: Router,
    engine: Arc<AdmissionEngine<S>>,
) -> Router {
    router.layer(middleware::from_fn_with_state(
        engine,
        admission_middleware::<S>,
    ))
}

/// A standalone router answering `200 OK` on `/check` when admitted.
pub fn check_router<S: QuotaStore + 'static>(engine: Arc<AdmissionEngine<S>>) -> Router {
    with_admission(Router::new().route("/check", any(|| async { StatusCode::OK })), engine)
}

/// Serve [`check_router`] on an already bound listener until `signal` resolves.
pub async fn serve_http<S, F>(
    listener: TcpListener,
    engine: Arc<AdmissionEngine<S>>,
    signal: F,
) -> Result<()>
where
    S: QuotaStore + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "HTTP admission endpoint listening");
    axum::serve(listener, check_router(engine))
        .with_graceful_shutdown(signal)
        .await?;
    info!("HTTP admission endpoint shutting down");
    Ok(())
}
