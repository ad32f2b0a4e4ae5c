//! Engine configuration loading

use crate::error::EngineError;
use multiwan_types::EngineConfig;
use std::path::Path;
use tracing::debug;

/// Load an `EngineConfig` from a JSON file; absent fields take their defaults
pub fn load_config(path: impl AsRef<Path>) -> Result<EngineConfig, EngineError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| EngineError::filesystem(path, e))?;
    let config = parse_config(&raw)?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Parse and validate a JSON configuration document
pub fn parse_config(raw: &str) -> Result<EngineConfig, EngineError> {
    let config: EngineConfig =
        serde_json::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &EngineConfig) -> Result<(), EngineError> {
    if config.chunk_size == 0 {
        return Err(EngineError::Config("chunk_size must be greater than zero".into()));
    }
    if config.connect_timeout_secs == 0 || config.read_timeout_secs == 0 {
        return Err(EngineError::Config("timeouts must be greater than zero".into()));
    }
    if config.pause_poll_interval_ms == 0 {
        return Err(EngineError::Config(
            "pause_poll_interval_ms must be greater than zero".into(),
        ));
    }
    if let Some(limit) = config.default_speed_limit {
        if !limit.is_finite() || limit < 0.0 {
            return Err(EngineError::Config(format!("invalid default_speed_limit: {}", limit)));
        }
    }
    Ok(())
}
