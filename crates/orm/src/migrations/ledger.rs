//! Ledger Repository
//!
//! Reads and writes the table recording which migration contents have been
//! applied, and creates that table on first use.

use chrono::{DateTime, Utc};

use super::definitions::{AreaKey, LedgerEntry, MigrationCandidate, MigrationConfig};
use crate::backends::{DatabaseRowExt, DatabaseValue};
use crate::error::{OrmError, OrmResult};
use crate::transaction::TransactionHandle;

/// PostgreSQL truncates identifiers longer than this
const MAX_IDENTIFIER_LEN: usize = 63;

/// Access to the ledger table
#[derive(Debug, Clone)]
pub struct LedgerRepository {
    schema: String,
    table: String,
    area: AreaKey,
}

impl LedgerRepository {
    pub fn new(schema: &str, table: &str, area: AreaKey) -> OrmResult<Self> {
        validate_identifier(schema)?;
        validate_identifier(table)?;
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
            area,
        })
    }

    pub fn from_config(config: &MigrationConfig) -> OrmResult<Self> {
        Self::new(&config.ledger_schema, &config.ledger_table, config.area.clone())
    }

    pub fn area(&self) -> &AreaKey {
        &self.area
    }

    /// `"schema"."table"`
    pub fn qualified_table(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.table)
        )
    }

    /// Serialize concurrent bootstraps until the surrounding transaction ends
    pub async fn lock_bootstrap(&self, handle: &mut TransactionHandle) -> OrmResult<()> {
        let key = format!("{}.{}", self.schema, self.table);
        handle
            .execute_update(
                "SELECT pg_advisory_xact_lock(hashtext($1))",
                &[key.into()],
                None,
            )
            .await?;
        Ok(())
    }

    /// Create the ledger schema when absent. Returns whether it was created.
    pub async fn ensure_schema_exists(&self, handle: &mut TransactionHandle) -> OrmResult<bool> {
        let existing = handle
            .get_one_or_null(
                "SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1",
                &[self.schema.as_str().into()],
            )
            .await?;
        if existing.is_some() {
            return Ok(false);
        }

        tracing::info!("Creating schema {}", self.schema);
        let sql = format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_identifier(&self.schema)
        );
        handle.execute_update(&sql, &[], None).await?;
        Ok(true)
    }

    /// Create the ledger table and its indexes when absent. Returns whether
    /// the table was created.
    pub async fn ensure_table_exists(&self, handle: &mut TransactionHandle) -> OrmResult<bool> {
        let existing = handle
            .get_one_or_null(
                "SELECT 1 FROM pg_catalog.pg_tables WHERE schemaname = $1 AND tablename = $2",
                &[self.schema.as_str().into(), self.table.as_str().into()],
            )
            .await?;
        if existing.is_some() {
            return Ok(false);
        }

        tracing::info!("Creating table {}.{}", self.schema, self.table);
        for sql in self.create_table_sql() {
            handle.execute_update(&sql, &[], None).await?;
        }
        Ok(true)
    }

    /// Table and index DDL
    fn create_table_sql(&self) -> Vec<String> {
        let table = self.qualified_table();
        let index = |suffix: &str, columns: &str| {
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_identifier(&format!("{}_{}", self.table, suffix)),
                table,
                columns
            )
        };

        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\n    \
                    id SERIAL PRIMARY KEY,\n    \
                    area_type TEXT NOT NULL,\n    \
                    area_name TEXT NOT NULL,\n    \
                    migration_name TEXT NOT NULL,\n    \
                    sha1 TEXT NOT NULL,\n    \
                    run_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP\n\
                )",
                table
            ),
            index("area_idx", "area_type, area_name, migration_name, run_at"),
            index("name_run_at_idx", "migration_name, run_at"),
            index("run_at_name_idx", "run_at, migration_name"),
        ]
    }

    /// Entries of this area, newest first
    pub async fn list_applied(&self, handle: &mut TransactionHandle) -> OrmResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT area_type, area_name, migration_name, sha1, run_at FROM {} \
             WHERE area_type = $1 AND area_name = $2 \
             ORDER BY run_at DESC, migration_name DESC",
            self.qualified_table()
        );
        let rows = handle.execute_query(&sql, &self.area_params()).await?;

        rows.iter()
            .map(|row| -> OrmResult<LedgerEntry> {
                Ok(LedgerEntry {
                    area_type: row.get("area_type")?,
                    area_name: row.get("area_name")?,
                    migration_name: row.get("migration_name")?,
                    digest: row.get("sha1")?,
                    applied_at: row.get::<DateTime<Utc>>("run_at")?,
                })
            })
            .collect()
    }

    /// Insert the ledger row for an applied candidate
    pub async fn record_applied(
        &self,
        handle: &mut TransactionHandle,
        candidate: &MigrationCandidate,
    ) -> OrmResult<()> {
        let sql = format!(
            "INSERT INTO {} (area_type, area_name, migration_name, sha1) VALUES ($1, $2, $3, $4)",
            self.qualified_table()
        );
        let mut params = self.area_params();
        params.push(candidate.name.as_str().into());
        params.push(candidate.digest.as_str().into());

        handle.execute_update(&sql, &params, Some(1)).await?;
        Ok(())
    }

    /// Delete the ledger row of a reverted migration
    pub async fn record_reverted(
        &self,
        handle: &mut TransactionHandle,
        entry: &LedgerEntry,
    ) -> OrmResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE area_type = $1 AND area_name = $2 AND migration_name = $3 AND sha1 = $4",
            self.qualified_table()
        );
        let params = vec![
            entry.area_type.as_str().into(),
            entry.area_name.as_str().into(),
            entry.migration_name.as_str().into(),
            entry.digest.as_str().into(),
        ];

        handle.execute_update(&sql, &params, Some(1)).await?;
        Ok(())
    }

    fn area_params(&self) -> Vec<DatabaseValue> {
        vec![
            self.area.area_type.as_str().into(),
            self.area.area_name.as_str().into(),
        ]
    }
}

/// Only plain identifiers are accepted for the ledger location
pub fn validate_identifier(name: &str) -> OrmResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(OrmError::Configuration(format!(
            "Invalid ledger identifier '{}': expected letters, digits and underscores",
            name
        )));
    }
    Ok(())
}

/// Double-quote an identifier
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
