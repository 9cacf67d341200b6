//! Turnstile - Per-Client Request Rate Limiting
//!
//! This crate implements token bucket rate limiting keyed by an opaque
//! client identifier, with a shared bucket registry, idle-bucket eviction,
//! and Axum middleware that meters requests by peer address.

pub mod http;
pub mod ratelimit;
pub mod config;
pub mod error;
