use anyhow::Context;
use std::sync::Arc;
use tern_core::config::redact;
use tern_core::MigratorConfig;
use tern_orm::{
    DatabasePoolConfig, ManagedPool, MigrationConfig, MigrationDirection, MigrationRegistry,
    MigrationRunResult, MigrationRunner,
};

/// Migrations compiled into the binary. SQL files need no registration.
fn registry() -> MigrationRegistry {
    MigrationRegistry::new()
}

fn pool_config(config: &MigratorConfig) -> DatabasePoolConfig {
    DatabasePoolConfig {
        // Every concurrent migration holds its own connection
        max_connections: config.max_connections.max(config.concurrency as u32),
        acquire_timeout_seconds: config.acquire_timeout_seconds,
        ..DatabasePoolConfig::default()
    }
}

fn migration_config(config: &MigratorConfig, dry_run: bool) -> MigrationConfig {
    MigrationConfig {
        migrations_dir: config.migrations_dir.clone(),
        concurrency: config.concurrency,
        dry_run,
        ..MigrationConfig::default()
    }
}

/// Connect, run, and close the pool on every path
pub async fn run(
    config: &MigratorConfig,
    direction: MigrationDirection,
    dry_run: bool,
) -> anyhow::Result<MigrationRunResult> {
    let url = config
        .database_url()
        .context("Failed to resolve database connection")?;

    tracing::debug!("Connecting to {}", redact(&url));
    let pool = ManagedPool::connect(&url, pool_config(config))
        .await
        .with_context(|| format!("Failed to connect to {}", redact(&url)))?;
    let pool = Arc::new(pool);

    let result = match MigrationRunner::new(
        Arc::clone(&pool),
        registry(),
        migration_config(config, dry_run),
    ) {
        Ok(runner) => runner.run(direction).await,
        Err(e) => Err(e),
    };

    if let Err(e) = pool.close().await {
        tracing::warn!("Failed to close database pool: {}", e);
    }

    result.with_context(|| format!("Migration {} failed", direction))
}

/// Human readable outcome for stdout
pub fn summary(result: &MigrationRunResult) -> String {
    if result.up_to_date {
        return "Already up-to-date.".to_string();
    }

    let heading = match (result.dry_run, result.direction) {
        (true, MigrationDirection::Up) => "Would apply",
        (true, MigrationDirection::Down) => "Would revert",
        (false, MigrationDirection::Up) => "Applied",
        (false, MigrationDirection::Down) => "Reverted",
    };

    let mut out = format!(
        "{} {} migration(s) in {} ms:",
        heading,
        result.processed.len(),
        result.execution_time_ms
    );
    for name in &result.processed {
        out.push_str("\n  ");
        out.push_str(name);
    }
    out
}
