use crate::config::{ConfigError, ConfigValidator, DatabaseUrlValidator};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

/// Configuration trait for application configuration
pub trait AppConfigTrait: Sized {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self, ConfigError>;

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::invalid_value("log_format", s, "text or json")),
        }
    }
}

/// Where the database connection comes from.
///
/// Containers usually hand over the individual `POSTGRES_*` variables with the
/// password mounted as a secret file, so both shapes are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseSettings {
    Url(String),
    Parts {
        host: String,
        port: u16,
        database: String,
        user: String,
        password: Option<PasswordSource>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordSource {
    File(PathBuf),
    Value(String),
}

impl PasswordSource {
    fn resolve(&self) -> Result<String, ConfigError> {
        match self {
            PasswordSource::Value(value) => Ok(value.clone()),
            PasswordSource::File(path) => fs::read_to_string(path)
                .map(|contents| contents.trim_end_matches(['\r', '\n']).to_string())
                .map_err(|source| ConfigError::SecretFile {
                    path: path.display().to_string(),
                    source,
                }),
        }
    }
}

/// Runtime configuration for the migration runner
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    pub database: Option<DatabaseSettings>,
    pub application_name: String,
    pub migrations_dir: PathBuf,
    pub concurrency: usize,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl MigratorConfig {
    pub fn new() -> Self {
        Self {
            database: None,
            application_name: "docker-app-migration".to_string(),
            migrations_dir: PathBuf::from("/data"),
            concurrency: 1,
            max_connections: 10,
            acquire_timeout_seconds: 30,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// `from_env` passes the process environment; tests pass a map. Values are
    /// only parsed here; call `validate()` once overrides have been applied.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        if let Some(url) = lookup("DATABASE_URL") {
            config.database = Some(DatabaseSettings::Url(url));
        } else if let Some(host) = lookup("POSTGRES_HOST") {
            let port = match lookup("POSTGRES_PORT") {
                Some(port_str) => port_str.parse().map_err(|_| {
                    ConfigError::invalid_value("postgres_port", port_str, "valid port number (1-65535)")
                })?,
                None => 5432,
            };
            let database = lookup("POSTGRES_DB").ok_or_else(|| {
                ConfigError::missing_required("postgres_db", "POSTGRES_DB must be set alongside POSTGRES_HOST")
            })?;
            let user = lookup("POSTGRES_USER").ok_or_else(|| {
                ConfigError::missing_required("postgres_user", "POSTGRES_USER must be set alongside POSTGRES_HOST")
            })?;
            let password = lookup("POSTGRES_PASSWORD_FILE")
                .map(|path| PasswordSource::File(PathBuf::from(path)))
                .or_else(|| lookup("POSTGRES_PASSWORD").map(PasswordSource::Value));

            config.database = Some(DatabaseSettings::Parts {
                host,
                port,
                database,
                user,
                password,
            });
        }

        if let Some(name) = lookup("MIGRATION_APPLICATION_NAME") {
            config.application_name = name;
        }

        if let Some(dir) = lookup("MIGRATIONS_DIR") {
            config.migrations_dir = PathBuf::from(dir);
        }

        if let Some(value) = lookup("MIGRATION_CONCURRENCY") {
            config.concurrency = value.parse().map_err(|_| {
                ConfigError::invalid_value("migration_concurrency", value, "positive integer")
            })?;
        }

        if let Some(value) = lookup("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = value.parse().map_err(|_| {
                ConfigError::invalid_value("database_max_connections", value, "positive integer")
            })?;
        }

        if let Some(value) = lookup("DATABASE_ACQUIRE_TIMEOUT") {
            config.acquire_timeout_seconds = value.parse().map_err(|_| {
                ConfigError::invalid_value("database_acquire_timeout", value, "number of seconds")
            })?;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }

        if let Some(format) = lookup("LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        Ok(config)
    }

    /// Resolve the connection URL, reading the password file if one is configured.
    ///
    /// The application name is appended as a query parameter so that the
    /// sessions show up under it in `pg_stat_activity`.
    pub fn database_url(&self) -> Result<String, ConfigError> {
        let settings = self.database.as_ref().ok_or_else(|| {
            ConfigError::missing_required(
                "database_url",
                "set DATABASE_URL or POSTGRES_HOST/POSTGRES_DB/POSTGRES_USER",
            )
        })?;

        let mut url = match settings {
            DatabaseSettings::Url(raw) => url::Url::parse(raw).map_err(|e| {
                ConfigError::invalid_value("database_url", super::redact(raw), format!("valid URL ({})", e))
            })?,
            DatabaseSettings::Parts {
                host,
                port,
                database,
                user,
                password,
            } => {
                let mut url = url::Url::parse(&format!("postgres://{}:{}", host, port)).map_err(|e| {
                    ConfigError::invalid_value("postgres_host", host.clone(), format!("valid host name ({})", e))
                })?;
                url.set_path(database);
                url.set_username(user)
                    .map_err(|_| ConfigError::invalid_value("postgres_user", user.clone(), "valid user name"))?;
                if let Some(password) = password {
                    let secret = password.resolve()?;
                    url.set_password(Some(&secret))
                        .map_err(|_| ConfigError::validation_failed("password cannot be encoded in a URL"))?;
                }
                url
            }
        };

        let has_application_name = url.query_pairs().any(|(key, _)| key == "application_name");
        if !has_application_name && !self.application_name.is_empty() {
            url.query_pairs_mut()
                .append_pair("application_name", &self.application_name);
        }

        Ok(url.to_string())
    }
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AppConfigTrait for MigratorConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(DatabaseSettings::Url(url)) = &self.database {
            DatabaseUrlValidator::default().validate(url)?;
        }

        if self.concurrency == 0 {
            return Err(ConfigError::invalid_value(
                "migration_concurrency",
                "0",
                "positive integer",
            ));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::invalid_value(
                "database_max_connections",
                "0",
                "positive integer",
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "log_level".to_string(),
                value: self.log_level.clone(),
                expected: format!("one of: {}", valid_levels.join(", ")),
            });
        }

        Ok(())
    }
}
