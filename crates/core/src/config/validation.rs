use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}. {hint}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Could not read secret file '{path}': {source}")]
    SecretFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Create a missing required field error
    pub fn missing_required(field: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
            hint: hint.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    /// Create a validation failed error
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }
}

/// Trait for validating configuration values
pub trait ConfigValidator<T> {
    /// Validate a configuration value
    fn validate(&self, value: &T) -> Result<(), ConfigError>;
}

/// Accepts PostgreSQL connection URLs only
pub struct DatabaseUrlValidator {
    pub schemes: Vec<String>,
}

impl Default for DatabaseUrlValidator {
    fn default() -> Self {
        Self {
            schemes: vec!["postgres".to_string(), "postgresql".to_string()],
        }
    }
}

impl ConfigValidator<String> for DatabaseUrlValidator {
    fn validate(&self, value: &String) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(value).map_err(|e| {
            ConfigError::invalid_value("database_url", redact(value), format!("valid URL ({})", e))
        })?;

        if !self.schemes.iter().any(|scheme| scheme == parsed.scheme()) {
            return Err(ConfigError::invalid_value(
                "database_url",
                redact(value),
                format!("URL with scheme: {}", self.schemes.join(", ")),
            ));
        }

        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(ConfigError::invalid_value(
                "database_url",
                redact(value),
                "URL with a host",
            ));
        }

        Ok(())
    }
}

/// Strip the password from a connection URL before it ends up in an error message
pub fn redact(value: &str) -> String {
    match url::Url::parse(value) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("****"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<unparseable>".to_string(),
    }
}
