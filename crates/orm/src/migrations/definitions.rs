//! Migration Definitions - Core types shared by the scanner, ledger and runner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationDirection {
    /// Apply pending migrations
    Up,
    /// Revert applied migrations
    Down,
}

impl MigrationDirection {
    /// `down` selects revert; anything else, or nothing, selects apply
    pub fn from_arg(arg: Option<&str>) -> Self {
        match arg {
            Some("down") => MigrationDirection::Down,
            _ => MigrationDirection::Up,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationDirection::Up => "up",
            MigrationDirection::Down => "down",
        }
    }
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A migration file found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationCandidate {
    /// File name, also the name recorded in the ledger
    pub name: String,
    pub path: PathBuf,
    /// Lowercase hex SHA-1 of the file contents
    pub digest: String,
}

/// Namespace of ledger rows owned by this runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaKey {
    pub area_type: String,
    pub area_name: String,
}

impl AreaKey {
    pub fn new(area_type: impl Into<String>, area_name: impl Into<String>) -> Self {
        Self {
            area_type: area_type.into(),
            area_name: area_name.into(),
        }
    }
}

impl Default for AreaKey {
    fn default() -> Self {
        Self::new("system", "pg")
    }
}

/// One row of the ledger table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub area_type: String,
    pub area_name: String,
    pub migration_name: String,
    #[serde(rename = "sha1")]
    pub digest: String,
    #[serde(rename = "run_at")]
    pub applied_at: DateTime<Utc>,
}

/// A migration selected for execution.
///
/// `entry` is set when reverting and names the ledger row to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMigration {
    pub candidate: MigrationCandidate,
    pub entry: Option<LedgerEntry>,
}

impl PlannedMigration {
    pub fn name(&self) -> &str {
        &self.candidate.name
    }
}

/// Configuration for the migration system
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Directory where migration files are stored
    pub migrations_dir: PathBuf,
    /// Schema holding the ledger table
    pub ledger_schema: String,
    /// Table name for tracking migrations
    pub ledger_table: String,
    pub area: AreaKey,
    /// Migrations run at the same time; 1 runs them in order
    pub concurrency: usize,
    /// Compute the plan without executing it
    pub dry_run: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("/data"),
            ledger_schema: "migration".to_string(),
            ledger_table: "migrations".to_string(),
            area: AreaKey::default(),
            concurrency: 1,
            dry_run: false,
        }
    }
}

/// Result of a run
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRunResult {
    pub direction: MigrationDirection,
    /// Names of migrations executed, or planned in a dry run
    pub processed: Vec<String>,
    /// Files that were neither selected nor unresolvable
    pub skipped_count: usize,
    pub up_to_date: bool,
    pub dry_run: bool,
    pub execution_time_ms: u128,
}
