//! Configuration parsing and validation for versiongate
//!
//! Supports TOML configuration with:
//! - Versioned schema
//! - Compliance policy (required version, deadline, escalation)
//! - Task cadence with documented defaults
//! - Validation that reports every problem at once

mod schema;
mod settings;
mod validation;

pub use schema::*;
pub use settings::*;
pub use validation::*;

use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("Unsupported config version: {0}")]
    UnsupportedVersion(u32),

    #[error("Missing required setting: {0}")]
    MissingSetting(&'static str),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Load and validate configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<Settings> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> ConfigResult<Settings> {
    let raw: RawConfig = toml::from_str(content)?;

    if raw.config_version != CURRENT_CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion(raw.config_version));
    }

    let errors = validate_config(&raw);
    if !errors.is_empty() {
        return Err(ConfigError::ValidationFailed { errors });
    }

    Ok(Settings::from_raw(raw))
}

/// Current supported config version
pub const CURRENT_CONFIG_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_minimal_config() {
        let config = r#"
            config_version = 1

            [compliance]
            required_version = "13.0"
            deadline_date = "01-02-2024"
            cutoff_time = "08:00"
        "#;

        let settings = parse_config(config).unwrap();
        assert_eq!(settings.compliance.required_version, "13.0");
    }

    #[test]
    fn reject_wrong_version() {
        let config = r#"
            config_version = 99

            [compliance]
            required_version = "13.0"
            deadline_date = "01-02-2024"
            cutoff_time = "08:00"
        "#;

        let result = parse_config(config);
        assert!(matches!(result, Err(ConfigError::UnsupportedVersion(99))));
    }

    #[test]
    fn reject_invalid_values() {
        let config = r#"
            config_version = 1

            [compliance]
            required_version = "13.0"
            deadline_date = "January 2nd"
            cutoff_time = "08:00"
        "#;

        let result = parse_config(config);
        assert!(matches!(result, Err(ConfigError::ValidationFailed { .. })));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            config_version = 1

            [compliance]
            required_version = "14.2"
            deadline_date = "06-30-2025"
            cutoff_time = "17:00"
            escalation = "time_bound"
            "#
        )
        .unwrap();

        let settings = load_config(file.path()).unwrap();
        assert_eq!(settings.compliance.escalation, EscalationKind::TimeBound);
        assert_eq!(settings.compliance.required_version, "14.2");
    }

    #[test]
    fn missing_file_is_read_error() {
        let result = load_config("/nonexistent/versiongate.toml");
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }
}
