//! PostgreSQL Backend Implementation
//!
//! Implements the backend traits on top of sqlx. Transactions are driven by
//! plain `BEGIN`/`COMMIT`/`ROLLBACK` statements on a single pooled connection,
//! so the handle owns the connection for the whole transaction.

use super::core::*;
use crate::error::{OrmError, OrmResult};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgPoolOptions, Column, Connection, Pool, Postgres, Row, TypeInfo, ValueRef};
use std::sync::Arc;
use std::time::Duration;

/// PostgreSQL database backend
#[derive(Debug, Default)]
pub struct PostgresBackend;

impl PostgresBackend {
    pub fn new() -> Self {
        Self
    }

    /// Create a connection pool from a database URL
    pub async fn create_pool(
        &self,
        database_url: &str,
        config: &DatabasePoolConfig,
    ) -> OrmResult<Arc<dyn DatabasePool>> {
        self.validate_database_url(database_url)?;

        let mut options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .test_before_acquire(config.test_before_acquire);

        if let Some(idle_timeout) = config.idle_timeout_seconds {
            options = options.idle_timeout(Duration::from_secs(idle_timeout));
        }

        if let Some(max_lifetime) = config.max_lifetime_seconds {
            options = options.max_lifetime(Duration::from_secs(max_lifetime));
        }

        let sqlx_pool = options
            .connect(database_url)
            .await
            .map_err(|e| OrmError::Connection(format!("Failed to create PostgreSQL pool: {}", e)))?;

        Ok(Arc::new(PostgresPool::new(sqlx_pool)))
    }

    pub fn validate_database_url(&self, url: &str) -> OrmResult<()> {
        if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
            return Err(OrmError::Connection(
                "Invalid PostgreSQL URL scheme".to_string(),
            ));
        }
        Ok(())
    }
}

/// PostgreSQL connection pool implementation
pub struct PostgresPool {
    pool: Pool<Postgres>,
}

impl PostgresPool {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabasePool for PostgresPool {
    async fn acquire(&self) -> OrmResult<Box<dyn DatabaseConnection>> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| OrmError::Connection(format!("Failed to acquire connection: {}", e)))?;

        Ok(Box::new(PostgresConnection::new(conn)))
    }

    async fn close(&self) -> OrmResult<()> {
        self.pool.close().await;
        Ok(())
    }

    fn stats(&self) -> DatabasePoolStats {
        let total = self.pool.size();
        let idle = self.pool.num_idle() as u32;

        DatabasePoolStats {
            total_connections: total,
            idle_connections: idle,
            active_connections: total.saturating_sub(idle),
        }
    }
}

/// PostgreSQL connection implementation
pub struct PostgresConnection {
    conn: sqlx::pool::PoolConnection<Postgres>,
}

impl PostgresConnection {
    pub fn new(conn: sqlx::pool::PoolConnection<Postgres>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DatabaseConnection for PostgresConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        let mut query = sqlx::query(sql);

        for param in params {
            query = bind_database_value(query, param);
        }

        let result = query
            .execute(&mut *self.conn)
            .await
            .map_err(|e| OrmError::Query(format!("Query execution failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> OrmResult<Vec<Box<dyn DatabaseRow>>> {
        let mut query = sqlx::query(sql);

        for param in params {
            query = bind_database_value(query, param);
        }

        let rows = query
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| OrmError::Query(format!("Query fetch failed: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| Box::new(PostgresRow::new(row)) as Box<dyn DatabaseRow>)
            .collect())
    }

    async fn close(self: Box<Self>) -> OrmResult<()> {
        // Detached connections are not returned to the pool; the pool opens a
        // replacement on demand.
        self.conn
            .detach()
            .close()
            .await
            .map_err(|e| OrmError::Connection(format!("Failed to close connection: {}", e)))
    }
}

/// PostgreSQL row implementation
pub struct PostgresRow {
    row: sqlx::postgres::PgRow,
}

impl PostgresRow {
    pub fn new(row: sqlx::postgres::PgRow) -> Self {
        Self { row }
    }
}

impl DatabaseRow for PostgresRow {
    fn get_by_index(&self, index: usize) -> OrmResult<DatabaseValue> {
        if index >= self.row.len() {
            return Err(OrmError::ColumnNotFound(index.to_string()));
        }
        postgres_value_to_database_value(&self.row, index)
    }

    fn get_by_name(&self, name: &str) -> OrmResult<DatabaseValue> {
        let index = self
            .row
            .columns()
            .iter()
            .position(|col| col.name() == name)
            .ok_or_else(|| OrmError::ColumnNotFound(name.to_string()))?;

        postgres_value_to_database_value(&self.row, index)
    }

    fn column_count(&self) -> usize {
        self.row.len()
    }

    fn column_names(&self) -> Vec<String> {
        self.row
            .columns()
            .iter()
            .map(|col| col.name().to_string())
            .collect()
    }
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'a>(
    query: sqlx::query::Query<'a, Postgres, sqlx::postgres::PgArguments>,
    value: &DatabaseValue,
) -> sqlx::query::Query<'a, Postgres, sqlx::postgres::PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Bytes(b) => query.bind(b.clone()),
        DatabaseValue::Uuid(u) => query.bind(*u),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
        DatabaseValue::Json(j) => query.bind(j.clone()),
    }
}

fn decode_error(kind: &str, e: sqlx::Error) -> OrmError {
    OrmError::Serialization(format!("Failed to get {} value: {}", kind, e))
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(
    row: &sqlx::postgres::PgRow,
    index: usize,
) -> OrmResult<DatabaseValue> {
    let raw = row.try_get_raw(index).map_err(|e| decode_error("raw", e))?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let type_name = row.columns()[index].type_info().name();

    match type_name {
        "BOOL" => Ok(DatabaseValue::Bool(
            row.try_get(index).map_err(|e| decode_error("bool", e))?,
        )),
        "INT2" => {
            let value: i16 = row.try_get(index).map_err(|e| decode_error("int16", e))?;
            Ok(DatabaseValue::Int32(value as i32))
        }
        "INT4" => Ok(DatabaseValue::Int32(
            row.try_get(index).map_err(|e| decode_error("int32", e))?,
        )),
        "INT8" => Ok(DatabaseValue::Int64(
            row.try_get(index).map_err(|e| decode_error("int64", e))?,
        )),
        "FLOAT4" => {
            let value: f32 = row.try_get(index).map_err(|e| decode_error("float32", e))?;
            Ok(DatabaseValue::Float64(value as f64))
        }
        "FLOAT8" => Ok(DatabaseValue::Float64(
            row.try_get(index).map_err(|e| decode_error("float64", e))?,
        )),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Ok(DatabaseValue::String(
            row.try_get(index).map_err(|e| decode_error("string", e))?,
        )),
        "BYTEA" => Ok(DatabaseValue::Bytes(
            row.try_get(index).map_err(|e| decode_error("bytes", e))?,
        )),
        "UUID" => Ok(DatabaseValue::Uuid(
            row.try_get(index).map_err(|e| decode_error("UUID", e))?,
        )),
        "TIMESTAMPTZ" => Ok(DatabaseValue::DateTime(
            row.try_get(index).map_err(|e| decode_error("datetime", e))?,
        )),
        "TIMESTAMP" => {
            let value: chrono::NaiveDateTime =
                row.try_get(index).map_err(|e| decode_error("timestamp", e))?;
            Ok(DatabaseValue::DateTime(value.and_utc()))
        }
        "JSON" | "JSONB" => {
            let value: JsonValue = row.try_get(index).map_err(|e| decode_error("JSON", e))?;
            Ok(DatabaseValue::Json(value))
        }
        _ => {
            let value: String = row.try_get_unchecked(index).map_err(|e| {
                OrmError::Serialization(format!(
                    "Failed to get value as string for unsupported type '{}': {}",
                    type_name, e
                ))
            })?;
            Ok(DatabaseValue::String(value))
        }
    }
}
