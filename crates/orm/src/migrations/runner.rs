//! Migration Runner - Executes migrations against the database
//!
//! A run bootstraps the ledger, diffs the migration directory against it and
//! executes every selected migration in its own transaction. The first
//! failure aborts the run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::definitions::{
    LedgerEntry, MigrationCandidate, MigrationConfig, MigrationDirection, MigrationRunResult,
    PlannedMigration,
};
use super::ledger::LedgerRepository;
use super::scanner::scan;
use super::script::{Migration, MigrationRegistry};
use crate::connection::ManagedPool;
use crate::error::{OrmError, OrmResult};
use crate::transaction::TransactionHandle;

type Work = (PlannedMigration, Arc<dyn Migration>);

/// Migration runner that executes migrations against a database
pub struct MigrationRunner {
    pool: Arc<ManagedPool>,
    registry: Arc<MigrationRegistry>,
    ledger: Arc<LedgerRepository>,
    config: MigrationConfig,
}

impl MigrationRunner {
    pub fn new(
        pool: Arc<ManagedPool>,
        registry: MigrationRegistry,
        config: MigrationConfig,
    ) -> OrmResult<Self> {
        if config.concurrency == 0 {
            return Err(OrmError::Configuration(
                "Migration concurrency must be at least 1".to_string(),
            ));
        }
        let ledger = LedgerRepository::from_config(&config)?;

        Ok(Self {
            pool,
            registry: Arc::new(registry),
            ledger: Arc::new(ledger),
            config,
        })
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ManagedPool> {
        &self.pool
    }

    pub fn ledger(&self) -> &LedgerRepository {
        &self.ledger
    }

    /// Run every pending migration in `direction`
    pub async fn run(&self, direction: MigrationDirection) -> OrmResult<MigrationRunResult> {
        let start_time = Instant::now();

        self.bootstrap().await?;

        let candidates = scan(&self.config.migrations_dir)?;
        let entries = self.applied().await?;
        let (runnable, scripts) = self.resolve(candidates)?;
        info!(
            "Found {} migration(s) in {}, {} recorded in the ledger",
            runnable.len(),
            self.config.migrations_dir.display(),
            entries.len()
        );

        let planned = plan(direction, &runnable, &entries);
        let skipped_count = runnable.len().saturating_sub(planned.len());
        let names: Vec<String> = planned.iter().map(|p| p.name().to_string()).collect();

        let result = |processed: Vec<String>, up_to_date: bool| MigrationRunResult {
            direction,
            processed,
            skipped_count,
            up_to_date,
            dry_run: self.config.dry_run,
            execution_time_ms: start_time.elapsed().as_millis(),
        };

        if planned.is_empty() {
            info!("Already up-to-date.");
            return Ok(result(Vec::new(), true));
        }

        let (verb, done) = match direction {
            MigrationDirection::Up => ("Running", "applied"),
            MigrationDirection::Down => ("Undoing", "reverted"),
        };

        if self.config.dry_run {
            info!("Dry run: {} migration(s) would be {}", planned.len(), done);
            for name in &names {
                info!("  {}", name);
            }
            return Ok(result(names, false));
        }

        info!("{} {} migration(s)", verb, planned.len());

        let mut work: Vec<Work> = Vec::with_capacity(planned.len());
        for migration in planned {
            let script = scripts.get(migration.name()).cloned().ok_or_else(|| {
                OrmError::Migration(format!("No script resolved for {}", migration.name()))
            })?;
            work.push((migration, script));
        }

        let processed = if self.config.concurrency > 1 && work.len() > 1 {
            self.execute_concurrent(direction, work).await?
        } else {
            self.execute_sequential(direction, work).await?
        };

        info!("{} migration(s) {}", processed.len(), done);
        Ok(result(processed, false))
    }

    /// Create the ledger schema and table when missing
    pub async fn bootstrap(&self) -> OrmResult<()> {
        let mut handle = self.pool.handle().await?;
        let result = self.bootstrap_in_transaction(&mut handle).await;
        settle(handle, result, "Ledger bootstrap").await
    }

    async fn bootstrap_in_transaction(&self, handle: &mut TransactionHandle) -> OrmResult<()> {
        handle.begin().await?;
        self.ledger.lock_bootstrap(handle).await?;
        let schema_created = self.ledger.ensure_schema_exists(handle).await?;
        let table_created = self.ledger.ensure_table_exists(handle).await?;
        handle.commit().await?;

        debug!(schema_created, table_created, "Ledger ready");
        Ok(())
    }

    /// Ledger entries of the configured area, newest first
    pub async fn applied(&self) -> OrmResult<Vec<LedgerEntry>> {
        let mut handle = self.pool.handle().await?;
        let result = self.ledger.list_applied(&mut handle).await;
        settle(handle, result, "Listing applied migrations").await
    }

    /// Keep the candidates a script exists for
    fn resolve(
        &self,
        candidates: Vec<MigrationCandidate>,
    ) -> OrmResult<(Vec<MigrationCandidate>, HashMap<String, Arc<dyn Migration>>)> {
        let mut runnable = Vec::with_capacity(candidates.len());
        let mut scripts = HashMap::new();

        for candidate in candidates {
            match self.registry.resolve(&candidate)? {
                Some(script) => {
                    scripts.insert(candidate.name.clone(), script);
                    runnable.push(candidate);
                }
                None => warn!(
                    "Skipping {}: not a .sql file and no compiled migration registered",
                    candidate.name
                ),
            }
        }

        Ok((runnable, scripts))
    }

    async fn execute_sequential(
        &self,
        direction: MigrationDirection,
        work: Vec<Work>,
    ) -> OrmResult<Vec<String>> {
        let mut processed = Vec::with_capacity(work.len());
        for (migration, script) in work {
            run_one(&self.pool, &self.ledger, direction, &migration, script.as_ref()).await?;
            processed.push(migration.candidate.name);
        }
        Ok(processed)
    }

    /// Bounded parallel execution. After a failure no further migration
    /// starts; the ones already running finish. The earliest failure in plan
    /// order is returned.
    async fn execute_concurrent(
        &self,
        direction: MigrationDirection,
        work: Vec<Work>,
    ) -> OrmResult<Vec<String>> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let stopped = Arc::new(AtomicBool::new(false));
        debug!(
            "Executing {} migration(s) with concurrency {}",
            work.len(),
            self.config.concurrency
        );

        let mut handles = Vec::with_capacity(work.len());
        for (migration, script) in work {
            let pool = Arc::clone(&self.pool);
            let ledger = Arc::clone(&self.ledger);
            let semaphore = Arc::clone(&semaphore);
            let stopped = Arc::clone(&stopped);

            handles.push(tokio::spawn(async move {
                let name = migration.candidate.name.clone();
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return (name, None),
                };

                if stopped.load(Ordering::SeqCst) {
                    return (name, None);
                }

                let result = run_one(&pool, &ledger, direction, &migration, script.as_ref()).await;
                if result.is_err() {
                    stopped.store(true, Ordering::SeqCst);
                }
                (name, Some(result))
            }));
        }

        let mut processed = Vec::new();
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok((name, Some(Ok(())))) => processed.push(name),
                Ok((_, Some(Err(err)))) => {
                    first_error.get_or_insert(err);
                }
                Ok((name, None)) => debug!("{} not started", name),
                Err(join_err) => {
                    first_error.get_or_insert(OrmError::Migration(format!(
                        "Migration task failed: {}",
                        join_err
                    )));
                }
            }
        }

        match first_error {
            Some(err) => {
                if !processed.is_empty() {
                    warn!(
                        "{} migration(s) committed before the run failed: {}",
                        processed.len(),
                        processed.join(", ")
                    );
                }
                Err(err)
            }
            None => Ok(processed),
        }
    }

    /// Close the pool
    pub async fn shutdown(&self) -> OrmResult<()> {
        self.pool.close().await.map_err(OrmError::from)
    }
}

/// Select the migrations to execute.
///
/// Up: candidates whose digest is not in the ledger, by file name.
/// Down: ledger entries, newest first, whose digest still exists on disk.
pub fn plan(
    direction: MigrationDirection,
    candidates: &[MigrationCandidate],
    entries: &[LedgerEntry],
) -> Vec<PlannedMigration> {
    match direction {
        MigrationDirection::Up => {
            let mut pending: Vec<PlannedMigration> = candidates
                .iter()
                .filter(|c| !entries.iter().any(|e| e.digest == c.digest))
                .map(|c| PlannedMigration {
                    candidate: c.clone(),
                    entry: None,
                })
                .collect();
            pending.sort_by(|a, b| a.candidate.name.cmp(&b.candidate.name));
            pending
        }
        MigrationDirection::Down => entries
            .iter()
            .filter_map(|entry| {
                candidates
                    .iter()
                    .find(|c| c.digest == entry.digest)
                    .map(|c| PlannedMigration {
                        candidate: c.clone(),
                        entry: Some(entry.clone()),
                    })
            })
            .collect(),
    }
}

/// One migration in its own transaction on its own connection
async fn run_one(
    pool: &ManagedPool,
    ledger: &LedgerRepository,
    direction: MigrationDirection,
    migration: &PlannedMigration,
    script: &dyn Migration,
) -> OrmResult<()> {
    let mut handle = pool.handle().await?;
    let result = apply_in_transaction(&mut handle, ledger, direction, migration, script).await;
    let context = format!("Migration {} ({})", migration.name(), direction);
    settle(handle, result, &context).await
}

async fn apply_in_transaction(
    handle: &mut TransactionHandle,
    ledger: &LedgerRepository,
    direction: MigrationDirection,
    migration: &PlannedMigration,
    script: &dyn Migration,
) -> OrmResult<()> {
    handle.begin().await?;

    match direction {
        MigrationDirection::Up => {
            info!("Running {}", migration.name());
            script.up(handle).await?;
            ledger.record_applied(handle, &migration.candidate).await?;
        }
        MigrationDirection::Down => {
            let entry = migration.entry.as_ref().ok_or_else(|| {
                OrmError::Migration(format!("No ledger entry for {}", migration.name()))
            })?;
            info!("Undoing {}", migration.name());
            script.down(handle).await?;
            ledger.record_reverted(handle, entry).await?;
        }
    }

    handle.commit().await
}

/// Release the handle. On failure roll back first and discard the
/// connection; a failing rollback is logged and the original error returned.
async fn settle<T>(
    mut handle: TransactionHandle,
    result: OrmResult<T>,
    context: &str,
) -> OrmResult<T> {
    match result {
        Ok(value) => {
            handle.release(None).await;
            Ok(value)
        }
        Err(err) => {
            error!("{} failed: {}", context, err);
            if handle.in_transaction() {
                if let Err(rollback_err) = handle.rollback().await {
                    warn!("{}: rollback failed: {}", context, rollback_err);
                }
            }
            handle.release(Some(&err)).await;
            Err(err)
        }
    }
}
