//! # tern-core
//!
//! Configuration loading and logging setup shared by the tern crates.

pub mod config;
pub mod logging;

pub use config::{
    AppConfigTrait, ConfigError, DatabaseSettings, LogFormat, MigratorConfig, PasswordSource,
};
pub use logging::{init_logging, LoggingConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get crate version
pub fn version() -> &'static str {
    VERSION
}
