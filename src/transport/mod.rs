//! Network transport for the admission service.
//!
//! Clients send one JSON object per line and receive one JSON object per line:
//!
//! ```text
//! -> {"domain":"checkout","descriptors":{"tier":"free"}}
//! <- {"code":"OK","remaining":2}
//! <- {"code":"OVER_LIMIT","reset_after_secs":41}
//! ```
//!
//! Lines longer than the configured maximum are answered with `ERROR` and
//! the connection is closed. The [`http`] module exposes the same engine as
//! axum middleware.

pub mod http;
mod server;
mod service;

pub use http::{admission_middleware, check_router, identity_from_headers, serve_http, with_admission};
pub use server::{serve_listener, TcpServer, DEFAULT_MAX_LINE_LENGTH};
pub use service::{AdmissionRequest, AdmissionResponse, AdmissionService, DEFAULT_DOMAIN};
