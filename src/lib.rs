//! Ratekeeper - Local Request Admission Control
//!
//! This crate decides whether to admit a unit of work for a caller-supplied
//! identity (a domain plus key/value descriptors), based on configured
//! per-identity quotas that are fully replenished at fixed window boundaries.
//! State lives in a local expiring store; nothing is shared between nodes.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod transport;
