//! Config validation: index name syntax and uniqueness.

use crate::config::{IndexConfig, ReducerConfig};
use crate::error::ConfigError;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn name_pattern() -> Result<&'static Regex, ConfigError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,127}$"))
        .as_ref()
        .map_err(|e| ConfigError::Validation(format!("index name pattern: {}", e)))
}

/// Index names double as URL path segments.
pub fn validate_index_name(name: &str) -> Result<(), ConfigError> {
    if name_pattern()?.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidName(name.to_string()))
    }
}

pub fn validate(configs: &[IndexConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for cfg in configs {
        validate_index_name(&cfg.name)?;
        if !names.insert(cfg.name.as_str()) {
            return Err(ConfigError::DuplicateName(cfg.name.clone()));
        }
        if cfg.source_resource_type.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "index '{}': source_resource_type is required",
                cfg.name
            )));
        }
        let empty_param = match &cfg.reducer {
            ReducerConfig::Count => None,
            ReducerConfig::CountBy { field } => field.is_empty().then_some("field"),
            ReducerConfig::SumBy { value_field, group_field } => {
                if value_field.is_empty() {
                    Some("value_field")
                } else if group_field.as_deref() == Some("") {
                    Some("group_field")
                } else {
                    None
                }
            }
            ReducerConfig::LatestByKey { key_field } => key_field.is_empty().then_some("key_field"),
        };
        if let Some(param) = empty_param {
            return Err(ConfigError::Validation(format!(
                "index '{}': reducer parameter '{}' must not be empty",
                cfg.name, param
            )));
        }
    }
    Ok(())
}
