//! Connection Management
//!
//! Owned connection pool with acquisition statistics.

pub mod pool;

pub use pool::*;
