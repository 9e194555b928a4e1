use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    if config.lane.trim().is_empty() {
        return Err(invalid("lane must not be empty"));
    }
    if config.chunk_size == 0 {
        return Err(invalid("chunk_size must be at least 1"));
    }
    if config.max_concurrency == 0 {
        return Err(invalid("max_concurrency must be at least 1"));
    }
    if config.max_retries == 0 {
        return Err(invalid("max_retries must be at least 1"));
    }
    if config.wave_timeout_secs == Some(0) {
        return Err(invalid("wave_timeout_secs must be positive when set"));
    }
    if config.destination.collection.trim().is_empty() {
        return Err(invalid("destination.collection must not be empty"));
    }

    let mut seen = std::collections::HashSet::new();
    for field in &config.destination.key_fields {
        if !seen.insert(field) {
            return Err(invalid(format!("Duplicate key field '{}'", field)));
        }
    }

    if let Some(import) = &config.import {
        if import.input_directory == import.processed_directory {
            return Err(invalid(
                "import.processed_directory must differ from import.input_directory",
            ));
        }
        if import.scan_interval_secs == 0 {
            return Err(invalid("import.scan_interval_secs must be at least 1"));
        }
    }

    if !LOG_LEVELS.contains(&config.logging.level.to_ascii_lowercase().as_str()) {
        return Err(invalid(format!(
            "Unknown log level: {}",
            config.logging.level
        )));
    }

    Ok(())
}
