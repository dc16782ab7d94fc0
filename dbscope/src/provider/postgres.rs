//! sqlx-backed Postgres implementation of the connection provider.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use eyre::Context as _;
use secrecy::{ExposeSecret as _, SecretString};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, pool::PoolConnection};
use tracing::instrument;

use crate::provider::{AcquireError, ConnectionProvider, PoolStatus, PooledConn};

/// Connection provider over an sqlx `PgPool`.
///
/// The pool owns sizing and acquire deadlines; the session factory only
/// ever sees the [`PooledConn`] handles it hands out.
pub struct PostgresProvider {
    pool: PgPool,
    acquire_timeout: Duration,
}

impl PostgresProvider {
    /// Connects to the database behind `connection_string`.
    #[instrument(level = "info", skip_all)]
    pub async fn init(
        connection_string: &SecretString,
        max_connections: NonZeroU32,
        acquire_timeout: Duration,
    ) -> eyre::Result<Self> {
        tracing::info!("connecting to DB...");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(acquire_timeout)
            .connect(connection_string.expose_secret())
            .await
            .context("while connecting to postgres DB")?;
        Ok(Self {
            pool,
            acquire_timeout,
        })
    }

    /// The wrapped pool, for collaborators that need direct access.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

struct PgConn {
    conn: PoolConnection<Postgres>,
    in_transaction: bool,
}

#[async_trait]
impl PooledConn for PgConn {
    async fn execute(&mut self, sql: &str) -> eyre::Result<u64> {
        let result = sqlx::query(sql)
            .execute(&mut *self.conn)
            .await
            .context("while executing statement")?;
        Ok(result.rows_affected())
    }

    async fn begin(&mut self) -> eyre::Result<()> {
        sqlx::query("BEGIN")
            .execute(&mut *self.conn)
            .await
            .context("while opening transaction")?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> eyre::Result<()> {
        sqlx::query("COMMIT")
            .execute(&mut *self.conn)
            .await
            .context("while committing transaction")?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> eyre::Result<()> {
        sqlx::query("ROLLBACK")
            .execute(&mut *self.conn)
            .await
            .context("while rolling back transaction")?;
        self.in_transaction = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn close(mut self: Box<Self>) -> eyre::Result<()> {
        // never return a connection with a transaction still open
        if self.in_transaction {
            sqlx::query("ROLLBACK")
                .execute(&mut *self.conn)
                .await
                .context("while rolling back before close")?;
        }
        // dropping the handle returns it to the pool
        Ok(())
    }
}

#[async_trait]
impl ConnectionProvider for PostgresProvider {
    async fn acquire(&self) -> Result<Box<dyn PooledConn>, AcquireError> {
        match self.pool.acquire().await {
            Ok(conn) => Ok(Box::new(PgConn {
                conn,
                in_transaction: false,
            })),
            Err(sqlx::Error::PoolTimedOut) => Err(AcquireError::Timeout(self.acquire_timeout)),
            Err(err) => Err(AcquireError::Backend(eyre::Report::new(err))),
        }
    }

    fn pool_status(&self) -> PoolStatus {
        let size = self.pool.size() as usize;
        let idle = self.pool.num_idle();
        PoolStatus {
            size,
            in_use: size.saturating_sub(idle),
            idle,
            // sqlx does not expose its waiter queue
            waiters: 0,
        }
    }

    async fn health(&self) -> eyre::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("while probing the database")?;
        Ok(())
    }
}
