//! Migration scripts
//!
//! The runner only knows the `Migration` trait. Scripts come from two places:
//! migrations compiled into the binary and registered by file name, and
//! `.sql` files loaded from disk.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::definitions::MigrationCandidate;
use super::sql_file::SqlFileMigration;
use crate::error::OrmResult;
use crate::transaction::TransactionHandle;

/// A unit of schema change. Every method runs inside the caller's transaction.
#[async_trait]
pub trait Migration: Send + Sync {
    async fn up(&self, handle: &mut TransactionHandle) -> OrmResult<()>;

    async fn down(&self, handle: &mut TransactionHandle) -> OrmResult<()>;

    /// Not invoked by the runner
    async fn test(&self, _handle: &mut TransactionHandle) -> OrmResult<()> {
        Ok(())
    }

    /// Not invoked by the runner
    async fn verify(&self, _handle: &mut TransactionHandle) -> OrmResult<()> {
        Ok(())
    }
}

/// Maps migration files to scripts
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    compiled: HashMap<String, Arc<dyn Migration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compiled migration under a file name or a file stem
    pub fn register(&mut self, name: impl Into<String>, migration: Arc<dyn Migration>) -> &mut Self {
        self.compiled.insert(name.into(), migration);
        self
    }

    pub fn with(mut self, name: impl Into<String>, migration: Arc<dyn Migration>) -> Self {
        self.register(name, migration);
        self
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// Script for a candidate, or `None` when the file is not runnable.
    ///
    /// Lookup order: registered file name, registered stem, `.sql` loader.
    pub fn resolve(&self, candidate: &MigrationCandidate) -> OrmResult<Option<Arc<dyn Migration>>> {
        if let Some(migration) = self.compiled.get(&candidate.name) {
            return Ok(Some(Arc::clone(migration)));
        }

        let stem = candidate.path.file_stem().and_then(|s| s.to_str());
        if let Some(migration) = stem.and_then(|stem| self.compiled.get(stem)) {
            return Ok(Some(Arc::clone(migration)));
        }

        let is_sql = candidate
            .path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("sql"));
        if is_sql {
            let migration = SqlFileMigration::load(&candidate.path)?;
            return Ok(Some(Arc::new(migration)));
        }

        Ok(None)
    }
}

impl fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.compiled.keys().collect();
        names.sort();
        f.debug_struct("MigrationRegistry")
            .field("compiled", &names)
            .finish()
    }
}
