//! # tern-orm: Database layer for the tern migration runner
//!
//! Backend traits over sqlx PostgreSQL, a managed connection pool, a
//! transactional handle that owns one connection, and the migration system:
//! content digests, the ledger table, SQL file loading and the runner.

pub mod backends;
pub mod connection;
pub mod error;
pub mod migrations;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use backends::{
    DatabaseConnection, DatabasePool, DatabasePoolConfig, DatabasePoolStats, DatabaseRow,
    DatabaseRowExt, DatabaseValue, PostgresBackend,
};
pub use connection::{ExtendedPoolStats, ManagedPool, PoolError};
pub use error::{OrmError, OrmResult};
pub use migrations::{
    AreaKey, LedgerEntry, LedgerRepository, Migration, MigrationCandidate, MigrationConfig,
    MigrationDirection, MigrationRegistry, MigrationRunResult, MigrationRunner, SqlFileMigration,
};
pub use transaction::TransactionHandle;
