//! In-memory connection provider with programmable failure modes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbscope::provider::{
    AcquireError, ConnectionProvider, ConnectionProviderService, PoolStatus, PooledConn,
};
use parking_lot::Mutex;

struct MemoryState {
    in_use: usize,
    total_acquired: u64,
    executed: Vec<String>,
    fail_next_acquire: bool,
}

struct Inner {
    pool_size: usize,
    acquire_delay: Option<Duration>,
    state: Mutex<MemoryState>,
}

/// A pool-shaped provider that never talks to a real database.
///
/// Statements are recorded instead of executed; acquisition fails with an
/// exhaustion error once `pool_size` connections are out, and single
/// failures can be injected with
/// [`MemoryProvider::fail_next_acquire`].
#[derive(Clone)]
pub struct MemoryProvider(Arc<Inner>);

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::with_pool_size(8)
    }
}

impl MemoryProvider {
    /// A provider with the default pool size.
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider whose pool holds `pool_size` connections.
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self(Arc::new(Inner {
            pool_size,
            acquire_delay: None,
            state: Mutex::new(MemoryState {
                in_use: 0,
                total_acquired: 0,
                executed: Vec::new(),
                fail_next_acquire: false,
            }),
        }))
    }

    /// A provider that suspends for `delay` on every acquisition, for
    /// exercising acquire deadlines.
    pub fn with_acquire_delay(pool_size: usize, delay: Duration) -> Self {
        Self(Arc::new(Inner {
            pool_size,
            acquire_delay: Some(delay),
            state: Mutex::new(MemoryState {
                in_use: 0,
                total_acquired: 0,
                executed: Vec::new(),
                fail_next_acquire: false,
            }),
        }))
    }

    /// Wraps this provider into the service trait object the factory
    /// consumes. Clones share all state.
    pub fn service(&self) -> ConnectionProviderService {
        Arc::new(self.clone())
    }

    /// Makes the next acquisition fail with a backend error.
    pub fn fail_next_acquire(&self) {
        self.0.state.lock().fail_next_acquire = true;
    }

    /// Connections currently handed out.
    pub fn in_use(&self) -> usize {
        self.0.state.lock().in_use
    }

    /// Connections handed out since creation.
    pub fn total_acquired(&self) -> u64 {
        self.0.state.lock().total_acquired
    }

    /// Every statement executed through this provider, in order.
    pub fn executed_statements(&self) -> Vec<String> {
        self.0.state.lock().executed.clone()
    }

    fn release(&self) {
        let mut state = self.0.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
    }
}

struct MemoryConn {
    provider: MemoryProvider,
    in_transaction: bool,
    released: bool,
}

#[async_trait]
impl PooledConn for MemoryConn {
    async fn execute(&mut self, sql: &str) -> eyre::Result<u64> {
        self.provider.0.state.lock().executed.push(sql.to_owned());
        Ok(1)
    }

    async fn begin(&mut self) -> eyre::Result<()> {
        if self.in_transaction {
            eyre::bail!("transaction already open");
        }
        self.in_transaction = true;
        self.provider.0.state.lock().executed.push("BEGIN".to_owned());
        Ok(())
    }

    async fn commit(&mut self) -> eyre::Result<()> {
        if !self.in_transaction {
            eyre::bail!("no open transaction");
        }
        self.in_transaction = false;
        self.provider.0.state.lock().executed.push("COMMIT".to_owned());
        Ok(())
    }

    async fn rollback(&mut self) -> eyre::Result<()> {
        self.in_transaction = false;
        self.provider
            .0
            .state
            .lock()
            .executed
            .push("ROLLBACK".to_owned());
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn close(mut self: Box<Self>) -> eyre::Result<()> {
        if !self.released {
            self.released = true;
            self.provider.release();
        }
        Ok(())
    }
}

impl Drop for MemoryConn {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.provider.release();
        }
    }
}

#[async_trait]
impl ConnectionProvider for MemoryProvider {
    async fn acquire(&self) -> Result<Box<dyn PooledConn>, AcquireError> {
        if let Some(delay) = self.0.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.0.state.lock();
        if state.fail_next_acquire {
            state.fail_next_acquire = false;
            return Err(AcquireError::Backend(eyre::eyre!(
                "injected acquire failure"
            )));
        }
        if state.in_use >= self.0.pool_size {
            return Err(AcquireError::Exhausted {
                in_use: state.in_use,
                size: self.0.pool_size,
            });
        }
        state.in_use += 1;
        state.total_acquired += 1;
        drop(state);
        Ok(Box::new(MemoryConn {
            provider: self.clone(),
            in_transaction: false,
            released: false,
        }))
    }

    fn pool_status(&self) -> PoolStatus {
        let state = self.0.state.lock();
        PoolStatus {
            size: self.0.pool_size,
            in_use: state.in_use,
            idle: self.0.pool_size.saturating_sub(state.in_use),
            waiters: 0,
        }
    }

    async fn health(&self) -> eyre::Result<()> {
        Ok(())
    }
}
