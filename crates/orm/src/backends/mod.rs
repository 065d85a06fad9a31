//! Database Backend Abstractions
//!
//! Traits the migration runner is written against, plus the PostgreSQL
//! implementation built on sqlx.

pub mod core;
pub mod postgres;

pub use self::core::*;
pub use postgres::{PostgresBackend, PostgresConnection, PostgresPool, PostgresRow};
