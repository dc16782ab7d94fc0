//! Core services that make up the session isolation layer.
//!
//! This module exposes the internal services used to issue, validate, and
//! protect database sessions. Each service encapsulates one responsibility
//! and is composed by the facade in the crate root.
//!
//! # Services overview
//!
//! - [`session_factory`] – issues request-scoped sessions, tracks them in a
//!   live-set, and reaps leaks in the background.
//! - [`session_metrics`] – the authoritative per-session and per-factory
//!   lifecycle records.
//! - [`scope_validator`] – stateless tagging and ownership checks on issued
//!   sessions.
//! - [`circuit_breaker`] – three-state breaker bounding calls to external
//!   dependencies.
//! - [`token_cache`] – TTL cache of positive auth verdicts for degraded
//!   operation.

pub mod circuit_breaker;
pub mod scope_validator;
pub mod session_factory;
pub mod session_metrics;
pub mod token_cache;
