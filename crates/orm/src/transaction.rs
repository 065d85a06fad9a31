//! Transaction Management
//!
//! `TransactionHandle` owns one pooled connection for the lifetime of a unit
//! of work. Transactions are opened with plain `BEGIN` so that the script,
//! the ledger write and the commit all run on the same session.

use crate::backends::{DatabaseConnection, DatabaseRow, DatabaseValue};
use crate::error::{OrmError, OrmResult};
use tracing::{debug, warn};

/// A checked-out connection plus its transaction state
pub struct TransactionHandle {
    conn: Option<Box<dyn DatabaseConnection>>,
    in_transaction: bool,
}

impl TransactionHandle {
    pub fn new(conn: Box<dyn DatabaseConnection>) -> Self {
        Self {
            conn: Some(conn),
            in_transaction: false,
        }
    }

    fn connection(&mut self) -> OrmResult<&mut Box<dyn DatabaseConnection>> {
        self.conn
            .as_mut()
            .ok_or_else(|| OrmError::Connection("Connection has already been released".to_string()))
    }

    /// Start a transaction
    pub async fn begin(&mut self) -> OrmResult<()> {
        debug!("BEGIN");
        self.connection()?
            .execute("BEGIN", &[])
            .await
            .map_err(|e| OrmError::Transaction(format!("Failed to begin transaction: {}", e)))?;
        self.in_transaction = true;
        Ok(())
    }

    /// Commit the open transaction
    pub async fn commit(&mut self) -> OrmResult<()> {
        debug!("COMMIT");
        let result = self
            .connection()?
            .execute("COMMIT", &[])
            .await
            .map_err(|e| OrmError::Transaction(format!("Failed to commit transaction: {}", e)));
        // A failed COMMIT still ends the transaction on the server
        self.in_transaction = false;
        result.map(|_| ())
    }

    /// Roll back the open transaction
    pub async fn rollback(&mut self) -> OrmResult<()> {
        debug!("ROLLBACK");
        let result = self
            .connection()?
            .execute("ROLLBACK", &[])
            .await
            .map_err(|e| OrmError::Transaction(format!("Failed to rollback transaction: {}", e)));
        self.in_transaction = false;
        result.map(|_| ())
    }

    /// Whether `BEGIN` was issued without a matching `COMMIT`/`ROLLBACK`
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Run a query and return every row
    pub async fn execute_query(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> OrmResult<Vec<Box<dyn DatabaseRow>>> {
        debug!(sql, params = params.len(), "query");
        self.connection()?.fetch_all(sql, params).await
    }

    /// Run a statement and return the affected row count.
    ///
    /// With `expected` set, any other count is a `RowCountMismatch`.
    pub async fn execute_update(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
        expected: Option<u64>,
    ) -> OrmResult<u64> {
        debug!(sql, params = params.len(), "update");
        let affected = self.connection()?.execute(sql, params).await?;

        match expected {
            Some(expected) if expected != affected => Err(OrmError::RowCountMismatch {
                expected,
                actual: affected,
            }),
            _ => Ok(affected),
        }
    }

    /// Zero rows yield `None`; more than one row is an error
    pub async fn get_one_or_null(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> OrmResult<Option<Box<dyn DatabaseRow>>> {
        let mut rows = self.execute_query(sql, params).await?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            count => Err(OrmError::NonUniqueResult { count }),
        }
    }

    /// Exactly one row or an error
    pub async fn single_result(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> OrmResult<Box<dyn DatabaseRow>> {
        self.get_one_or_null(sql, params)
            .await?
            .ok_or(OrmError::EmptyResult)
    }

    /// Give the connection back. With an error attached the connection is
    /// closed instead of returning to the pool. Releasing twice is a no-op.
    pub async fn release(&mut self, error: Option<&OrmError>) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        self.in_transaction = false;

        match error {
            None => drop(conn),
            Some(err) => {
                debug!("Discarding connection after error: {}", err);
                if let Err(close_err) = conn.close().await {
                    warn!("Failed to close connection: {}", close_err);
                }
            }
        }
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.conn.is_some() {
            warn!(
                in_transaction = self.in_transaction,
                "Transaction handle dropped without release"
            );
        }
    }
}
