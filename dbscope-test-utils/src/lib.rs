//! Test collaborators for dbscope-based services.
//!
//! Provides an in-memory [`MemoryProvider`] implementing the connection
//! provider interface with programmable failure modes, and a
//! [`ScriptedAuthApi`] whose validation outcomes are scripted per call.

mod memory_provider;
mod scripted_auth;

pub use memory_provider::*;
pub use scripted_auth::*;

use dbscope_types::Identity;

/// An identity for `user` with a fixed request id derived from the user
/// name. Panics on an empty user name; tests pass literals.
pub fn test_identity(user: &str) -> Identity {
    Identity::builder(user)
        .request_id(format!("req_{user}"))
        .build()
        .expect("test identity is well-formed")
}

/// Installs a compact subscriber honoring `RUST_LOG`, for debugging tests.
/// Safe to call from several tests; only the first call wins.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
