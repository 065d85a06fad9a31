//! # Structured Logging
//!
//! `tracing-subscriber` setup for the migration runner. Lines go to stderr so
//! that machine-readable output on stdout is never interleaved with logs.

use crate::config::{LogFormat, MigratorConfig};
use serde_json::{json, Value};
use std::io;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn")
    pub level: String,
    /// Enable JSON structured logging (vs plain text)
    pub json_format: bool,
    /// Include file and line number information
    pub include_location: bool,
    /// Environment filter (supports complex filters like "tern_orm=debug,sqlx=warn")
    pub env_filter: Option<String>,
    /// Custom fields added to the initialization event
    pub global_fields: serde_json::Map<String, Value>,
    /// Service name to include in the initialization event
    pub service_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
            env_filter: None,
            global_fields: serde_json::Map::new(),
            service_name: None,
        }
    }
}

impl LoggingConfig {
    /// Derive the logging setup from the runner configuration
    pub fn from_config(config: &MigratorConfig) -> Self {
        Self {
            level: config.log_level.clone(),
            json_format: config.log_format == LogFormat::Json,
            // sqlx logs every statement at info; keep it one step quieter
            env_filter: Some(format!("{},sqlx=warn", config.log_level)),
            ..Self::default()
        }
    }

    /// Add a global field to the initialization event
    pub fn with_global_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.global_fields.insert(key.into(), value.into());
        self
    }

    /// Set service name
    pub fn with_service(mut self, name: &str) -> Self {
        self.service_name = Some(name.to_string());
        self
    }

    /// Set environment filter
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// The filter directive used when `RUST_LOG` is not set
    pub fn filter_directive(&self) -> &str {
        self.env_filter.as_deref().unwrap_or(&self.level)
    }
}

/// Initialize logging for the process. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directive()))?;

    let layer = Layer::new()
        .with_writer(io::stderr)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()?;
    }

    if config.global_fields.is_empty() && config.service_name.is_none() {
        tracing::debug!(
            target: "tern::logging",
            "Logging initialized (level: {}, format: {})",
            config.level,
            if config.json_format { "JSON" } else { "text" }
        );
    } else {
        let mut init_msg = json!({
            "message": "Logging initialized",
            "level": config.level,
            "json_format": config.json_format,
        });
        if let Some(name) = config.service_name {
            init_msg["service_name"] = json!(name);
        }
        for (key, value) in config.global_fields {
            init_msg[key] = value;
        }
        tracing::debug!(target: "tern::logging", "{}", init_msg);
    }

    Ok(())
}
