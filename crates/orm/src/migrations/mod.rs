//! Migration System
//!
//! Content-addressed migrations: a file is applied when its SHA-1 is absent
//! from the ledger, and reverted only while the same bytes are still on disk.

pub mod definitions;
pub mod hasher;
pub mod ledger;
pub mod runner;
pub mod scanner;
pub mod script;
pub mod sql_file;

pub use definitions::*;
pub use hasher::content_digest;
pub use ledger::LedgerRepository;
pub use runner::{plan, MigrationRunner};
pub use scanner::scan;
pub use script::{Migration, MigrationRegistry};
pub use sql_file::{split_sql_statements, SqlFileMigration};
