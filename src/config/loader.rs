//! Load index registrations from JSON files and engine tuning from env.

use crate::config::{validate, EngineConfig, IndexConfig};
use crate::error::ConfigError;
use std::path::Path;

/// Load index configs from a JSON file (array or single object) or from a directory of `*.json` files.
/// Directory entries are read in filename order. The result is validated before it is returned.
pub async fn load_index_configs(path: impl AsRef<Path>) -> Result<Vec<IndexConfig>, ConfigError> {
    let path = path.as_ref();
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;

    let mut configs = Vec::new();
    if meta.is_dir() {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ConfigError::Load(e.to_string()))?
        {
            let p = entry.path();
            if p.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(p);
            }
        }
        files.sort();
        for file in files {
            configs.extend(read_config_file(&file).await?);
        }
    } else {
        configs = read_config_file(path).await?;
    }

    validate(&configs)?;
    tracing::debug!(path = %path.display(), count = configs.len(), "loaded index configs");
    Ok(configs)
}

async fn read_config_file(path: &Path) -> Result<Vec<IndexConfig>, ConfigError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    let parsed = match value {
        serde_json::Value::Array(_) => serde_json::from_value::<Vec<IndexConfig>>(value),
        other => serde_json::from_value::<IndexConfig>(other).map(|c| vec![c]),
    };
    parsed.map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))
}

impl EngineConfig {
    /// Defaults overridden by `MATERIALIZE_CATCH_UP_TIMEOUT_MS`, `MATERIALIZE_QUEUE_CAPACITY`,
    /// `MATERIALIZE_RETRY_INITIAL_BACKOFF_MS`, `MATERIALIZE_RETRY_MAX_BACKOFF_MS` and `MATERIALIZE_RETRY_MAX_ATTEMPTS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = EngineConfig::default();
        if let Some(v) = parse_var(&lookup, "MATERIALIZE_CATCH_UP_TIMEOUT_MS")? {
            cfg.catch_up_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MATERIALIZE_QUEUE_CAPACITY")? {
            if v == 0 {
                return Err(ConfigError::Load("MATERIALIZE_QUEUE_CAPACITY must be at least 1".into()));
            }
            cfg.queue_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "MATERIALIZE_RETRY_INITIAL_BACKOFF_MS")? {
            cfg.retry_initial_backoff_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MATERIALIZE_RETRY_MAX_BACKOFF_MS")? {
            cfg.retry_max_backoff_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MATERIALIZE_RETRY_MAX_ATTEMPTS")? {
            cfg.retry_max_attempts = v;
        }
        Ok(cfg)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Load(format!("{} is not a valid number: '{}'", key, raw))),
    }
}
