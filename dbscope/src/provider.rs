//! Connection-provider interface consumed by the session factory.
//!
//! The provider owns the real connection pool (size, acquire timeout); the
//! factory never duplicates pooling. Implementations hand out
//! [`PooledConn`] handles and take them back on close.
//!
//! Current implementations:
//! - Postgres via `sqlx` (behind the `postgres` feature)
//! - an in-memory provider for tests (in the `dbscope-test-utils` crate)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(feature = "postgres")]
pub mod postgres;

/// Dynamic trait object for the connection provider.
///
/// Must be `Send + Sync` to work with async contexts.
pub type ConnectionProviderService = Arc<dyn ConnectionProvider + Send + Sync>;

/// Why the provider could not hand out a connection.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// Every pooled connection is in use and the pool will not grow.
    #[error("connection pool exhausted ({in_use}/{size} in use)")]
    Exhausted {
        /// Connections currently handed out.
        in_use: usize,
        /// Total pool capacity.
        size: usize,
    },
    /// The pool did not produce a connection within its acquire deadline.
    #[error("timed out acquiring a connection after {0:?}")]
    Timeout(
        /// The deadline that elapsed.
        Duration,
    ),
    /// The backend rejected or dropped the connection attempt.
    #[error("backend connection error: {0}")]
    Backend(
        /// The backend's failure.
        eyre::Report,
    ),
}

impl AcquireError {
    /// Whether this failure should count as a pool-exhaustion event.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, AcquireError::Exhausted { .. } | AcquireError::Timeout(_))
    }
}

/// A snapshot of the provider's pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Total pool capacity.
    pub size: usize,
    /// Connections currently handed out.
    pub in_use: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Tasks currently waiting for a connection.
    pub waiters: usize,
}

/// One pooled database connection, exclusively owned while handed out.
///
/// Dropping a handle without calling [`PooledConn::close`] must release the
/// connection as well; `close` exists so callers can observe close errors
/// and providers can distinguish an orderly return from a drop.
#[async_trait]
pub trait PooledConn: Send {
    /// Executes a statement and returns the number of affected rows.
    async fn execute(&mut self, sql: &str) -> eyre::Result<u64>;

    /// Opens a transaction on this connection.
    async fn begin(&mut self) -> eyre::Result<()>;

    /// Commits the open transaction.
    async fn commit(&mut self) -> eyre::Result<()>;

    /// Rolls back the open transaction.
    async fn rollback(&mut self) -> eyre::Result<()>;

    /// Whether a transaction is currently open on this connection.
    fn in_transaction(&self) -> bool;

    /// Returns the connection to the provider. Idempotent.
    async fn close(self: Box<Self>) -> eyre::Result<()>;
}

/// The pool-backed async session opener the factory builds on.
#[async_trait]
pub trait ConnectionProvider {
    /// Acquires a connection from the pool. May suspend while the pool is
    /// busy; fails with [`AcquireError`] when it cannot produce one.
    async fn acquire(&self) -> Result<Box<dyn PooledConn>, AcquireError>;

    /// Current pool usage.
    fn pool_status(&self) -> PoolStatus;

    /// Probes the backend.
    async fn health(&self) -> eyre::Result<()>;
}
