//! Client registry: resolves an endpoint + model selection to a concrete
//! provider adapter and its static model limits.
//!
//! The registry is an immutable snapshot built once from configuration.
//! Credential rotation or config reload builds a fresh snapshot and swaps
//! it atomically; readers clone the `Arc` and are never blocked by a
//! reload in progress.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use palaver_common::{Error, Result};
use palaver_config::loader::resolve_api_key;
use palaver_config::{AppConfig, EndpointConfig, ProviderKind};
use tracing::info;

use crate::providers::{
    AnthropicAdapter, BedrockAdapter, CompatAdapter, GoogleAdapter, OpenAiAdapter, ProviderAdapter,
};
use crate::tokens::ModelLimits;

/// Everything a session needs to talk to one endpoint/model pair.
#[derive(Clone)]
pub struct ResolvedClient {
    pub endpoint: String,
    pub model: String,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub limits: ModelLimits,
}

impl std::fmt::Debug for ResolvedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("adapter", &"<dyn ProviderAdapter>")
            .field("limits", &self.limits)
            .finish()
    }
}

struct EndpointEntry {
    adapter: Arc<dyn ProviderAdapter>,
    models: HashMap<String, ModelLimits>,
}

struct Snapshot {
    endpoints: HashMap<String, EndpointEntry>,
}

pub struct ClientRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl ClientRegistry {
    /// Build a registry from loaded configuration. Fails fast on a
    /// missing credential or malformed endpoint.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let snapshot = Self::build(config)?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Rebuild from new configuration and swap the snapshot atomically.
    /// In-flight sessions keep the adapter they resolved.
    pub fn reload(&self, config: &AppConfig) -> Result<()> {
        let snapshot = Self::build(config)?;
        *self.snapshot.write().unwrap() = Arc::new(snapshot);
        info!("client registry reloaded");
        Ok(())
    }

    fn build(config: &AppConfig) -> Result<Snapshot> {
        let mut endpoints = HashMap::new();
        for endpoint in &config.endpoints {
            let adapter = build_adapter(endpoint)?;
            let models = endpoint
                .models
                .iter()
                .map(|m| {
                    (
                        m.id.clone(),
                        ModelLimits {
                            context_window: m.context_window,
                            max_output: m.max_output,
                        },
                    )
                })
                .collect();
            info!(
                endpoint = %endpoint.name,
                provider = adapter.id(),
                models = endpoint.models.len(),
                "registered provider endpoint"
            );
            endpoints.insert(endpoint.name.clone(), EndpointEntry { adapter, models });
        }
        Ok(Snapshot { endpoints })
    }

    /// Resolve an endpoint/model pair. Pure lookup, no side effects.
    pub fn resolve(&self, endpoint: &str, model: &str) -> Result<ResolvedClient> {
        let snapshot = self.snapshot.read().unwrap().clone();
        let entry = snapshot
            .endpoints
            .get(endpoint)
            .ok_or_else(|| Error::Configuration(format!("unknown endpoint '{endpoint}'")))?;
        let limits = entry.models.get(model).ok_or_else(|| {
            Error::Configuration(format!(
                "model '{model}' is not configured on endpoint '{endpoint}'"
            ))
        })?;
        Ok(ResolvedClient {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            adapter: entry.adapter.clone(),
            limits: *limits,
        })
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        let snapshot = self.snapshot.read().unwrap().clone();
        let mut names: Vec<String> = snapshot.endpoints.keys().cloned().collect();
        names.sort();
        names
    }

    /// Probe every endpoint's reachability concurrently.
    pub async fn health_report(&self) -> Vec<(String, bool)> {
        let snapshot = self.snapshot.read().unwrap().clone();
        let checks = snapshot.endpoints.iter().map(|(name, entry)| {
            let name = name.clone();
            let adapter = entry.adapter.clone();
            async move {
                let healthy = adapter.health_check().await.unwrap_or(false);
                (name, healthy)
            }
        });
        let mut report = join_all(checks).await;
        report.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }
}

fn build_adapter(endpoint: &EndpointConfig) -> Result<Arc<dyn ProviderAdapter>> {
    let api_key = resolve_api_key(endpoint)?;
    let require_key = |key: Option<String>| {
        key.ok_or_else(|| {
            Error::Configuration(format!(
                "endpoint '{}' ({:?}) requires api_key_env",
                endpoint.name, endpoint.provider
            ))
        })
    };

    let adapter: Arc<dyn ProviderAdapter> = match endpoint.provider {
        ProviderKind::Anthropic => {
            let mut adapter = AnthropicAdapter::new(require_key(api_key)?);
            if let Some(base_url) = &endpoint.base_url {
                adapter = adapter.with_base_url(base_url.clone());
            }
            Arc::new(adapter)
        }
        ProviderKind::OpenAi => Arc::new(OpenAiAdapter::new(
            require_key(api_key)?,
            endpoint.base_url.clone(),
        )),
        ProviderKind::Google => {
            let mut adapter = GoogleAdapter::new(require_key(api_key)?);
            if let Some(base_url) = &endpoint.base_url {
                adapter = adapter.with_base_url(base_url.clone());
            }
            Arc::new(adapter)
        }
        ProviderKind::Bedrock => {
            let region = endpoint.region.as_deref().ok_or_else(|| {
                Error::Configuration(format!(
                    "bedrock endpoint '{}' requires a region",
                    endpoint.name
                ))
            })?;
            let mut adapter = BedrockAdapter::new(require_key(api_key)?, region);
            if let Some(base_url) = &endpoint.base_url {
                adapter = adapter.with_base_url(base_url.clone());
            }
            Arc::new(adapter)
        }
        ProviderKind::OpenAiCompat => {
            let base_url = endpoint.base_url.clone().ok_or_else(|| {
                Error::Configuration(format!(
                    "openai_compat endpoint '{}' requires a base_url",
                    endpoint.name
                ))
            })?;
            Arc::new(CompatAdapter::new(base_url, api_key))
        }
    };
    Ok(adapter)
}
