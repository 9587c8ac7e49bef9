use std::env;
use std::path::Path;

use palaver_common::{Error, Result};
use tracing::info;

use crate::model::{AppConfig, EndpointConfig};

/// Loads and validates the generation-layer configuration.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Read an `AppConfig` from a TOML file.
    pub fn load(path: &Path) -> Result<AppConfig> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::parse(&raw)?;
        info!(
            endpoints = config.endpoints.len(),
            "loaded generation config from {}",
            path.display()
        );
        Ok(config)
    }

    /// Parse an `AppConfig` from TOML text and validate endpoint shape.
    pub fn parse(raw: &str) -> Result<AppConfig> {
        let config: AppConfig =
            toml::from_str(raw).map_err(|e| Error::Configuration(format!("invalid config: {e}")))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &AppConfig) -> Result<()> {
        for endpoint in &config.endpoints {
            if endpoint.models.is_empty() {
                return Err(Error::Configuration(format!(
                    "endpoint '{}' declares no models",
                    endpoint.name
                )));
            }
            let dup = config
                .endpoints
                .iter()
                .filter(|e| e.name == endpoint.name)
                .count();
            if dup > 1 {
                return Err(Error::Configuration(format!(
                    "duplicate endpoint name '{}'",
                    endpoint.name
                )));
            }
        }
        Ok(())
    }
}

/// Resolve an endpoint's API key through its `api_key_env` indirection.
///
/// Returns `Ok(None)` when the endpoint declares no credential (local or
/// keyless deployments); a declared-but-unset variable is a configuration
/// error so misdeployments fail at registry build, not mid-request.
pub fn resolve_api_key(endpoint: &EndpointConfig) -> Result<Option<String>> {
    match &endpoint.api_key_env {
        None => Ok(None),
        Some(var) => match env::var(var) {
            Ok(key) if !key.is_empty() => Ok(Some(key)),
            _ => Err(Error::Configuration(format!(
                "endpoint '{}': credential variable {var} is not set",
                endpoint.name
            ))),
        },
    }
}
