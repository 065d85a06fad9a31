//! Connection Pool Management
//!
//! `ManagedPool` is the one shared resource of a run. It is constructed once
//! at process start, handed to the runner by `Arc`, and closed at the end.

use crate::backends::{DatabasePool, DatabasePoolConfig, DatabasePoolStats, PostgresBackend};
use crate::error::OrmError;
use crate::transaction::TransactionHandle;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Database connection pool error types
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Connection acquisition failed: {0}")]
    AcquisitionFailed(String),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Failed to close pool: {0}")]
    CloseFailed(String),
}

impl From<PoolError> for OrmError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::AcquisitionFailed(err_msg) => {
                OrmError::Connection(format!("Database connection failed: {}", err_msg))
            }
            PoolError::PoolClosed => OrmError::Connection("Database pool is closed".to_string()),
            PoolError::CloseFailed(err_msg) => {
                OrmError::Connection(format!("Database pool close failed: {}", err_msg))
            }
        }
    }
}

/// Pool statistics plus acquisition counters
#[derive(Debug, Clone)]
pub struct ExtendedPoolStats {
    pub pool_stats: DatabasePoolStats,
    pub acquire_count: u64,
    pub acquire_errors: u64,
}

/// Managed connection pool wrapper with statistics
pub struct ManagedPool {
    pool: Arc<dyn DatabasePool>,
    config: DatabasePoolConfig,
    acquire_count: AtomicU64,
    acquire_errors: AtomicU64,
    closed: AtomicBool,
}

impl ManagedPool {
    pub fn new(pool: Arc<dyn DatabasePool>, config: DatabasePoolConfig) -> Self {
        Self {
            pool,
            config,
            acquire_count: AtomicU64::new(0),
            acquire_errors: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Connect a PostgreSQL pool
    pub async fn connect(database_url: &str, config: DatabasePoolConfig) -> Result<Self, PoolError> {
        let pool = PostgresBackend::new()
            .create_pool(database_url, &config)
            .await
            .map_err(|e| PoolError::AcquisitionFailed(e.to_string()))?;

        tracing::debug!(
            "Database pool created (max connections: {})",
            config.max_connections
        );
        Ok(Self::new(pool, config))
    }

    /// Acquire a connection from the pool with statistics tracking
    pub async fn acquire(&self) -> Result<Box<dyn crate::backends::DatabaseConnection>, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::PoolClosed);
        }

        self.acquire_count.fetch_add(1, Ordering::Relaxed);

        match self.pool.acquire().await {
            Ok(conn) => {
                let stats = self.pool.stats();
                tracing::debug!(
                    "Database connection acquired (total: {}, idle: {})",
                    stats.total_connections,
                    stats.idle_connections
                );
                Ok(conn)
            }
            Err(e) => {
                self.acquire_errors.fetch_add(1, Ordering::Relaxed);
                let pool_error = PoolError::AcquisitionFailed(e.to_string());
                tracing::error!("Failed to acquire database connection: {}", pool_error);
                Err(pool_error)
            }
        }
    }

    /// Acquire a connection wrapped in a transactional handle
    pub async fn handle(&self) -> Result<TransactionHandle, PoolError> {
        Ok(TransactionHandle::new(self.acquire().await?))
    }

    /// Get pool statistics with acquisition counters
    pub fn extended_stats(&self) -> ExtendedPoolStats {
        ExtendedPoolStats {
            pool_stats: self.pool.stats(),
            acquire_count: self.acquire_count.load(Ordering::Relaxed),
            acquire_errors: self.acquire_errors.load(Ordering::Relaxed),
        }
    }

    pub fn stats(&self) -> DatabasePoolStats {
        self.pool.stats()
    }

    /// Get connection pool configuration
    pub fn config(&self) -> &DatabasePoolConfig {
        &self.config
    }

    /// Close the connection pool. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), PoolError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let stats = self.extended_stats();
        tracing::debug!(
            "Closing database pool (total: {}, idle: {}, acquired: {}, errors: {})",
            stats.pool_stats.total_connections,
            stats.pool_stats.idle_connections,
            stats.acquire_count,
            stats.acquire_errors
        );

        self.pool
            .close()
            .await
            .map_err(|e| PoolError::CloseFailed(e.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
