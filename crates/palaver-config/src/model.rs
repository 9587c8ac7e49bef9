use serde::Deserialize;

/// Top-level configuration for the generation layer.
///
/// Loaded once at startup and treated as read-only afterwards; a credential
/// rotation builds a fresh `AppConfig` and swaps the registry snapshot
/// wholesale rather than mutating this in place.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// One configured provider endpoint and the models it serves.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Name route handlers use to select this endpoint.
    pub name: String,
    pub provider: ProviderKind,
    /// Override for self-hosted or proxied deployments. Required for
    /// `openai_compat`; ignored by `bedrock` (which derives its host from
    /// `region`).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key. Indirection
    /// keeps raw credentials out of config files.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// AWS region, `bedrock` endpoints only.
    #[serde(default)]
    pub region: Option<String>,
    pub models: Vec<ModelConfig>,
}

/// Closed set of supported provider protocol families. Adding a backend
/// means adding a variant here and an adapter implementing the fixed
/// adapter contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Google,
    Bedrock,
    #[serde(rename = "openai_compat")]
    OpenAiCompat,
}

/// Static per-model limits used to derive token budgets.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub context_window: usize,
    pub max_output: usize,
}

/// Tuning knobs for generation sessions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum tool round trips within one assistant turn.
    pub max_tool_rounds: usize,
    /// Dispatch attempts per request, counting the first.
    pub max_attempts: usize,
    /// Base delay for exponential backoff between retries.
    pub base_backoff_ms: u64,
    /// Abort a dispatch when the stream stays silent this long.
    pub idle_timeout_secs: u64,
    /// Per tool call execution timeout.
    pub tool_timeout_secs: u64,
    /// What to do with partially streamed text when a session is cancelled.
    pub on_cancel: CancellationPolicy,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 10,
            max_attempts: 3,
            base_backoff_ms: 500,
            idle_timeout_secs: 120,
            tool_timeout_secs: 30,
            on_cancel: CancellationPolicy::PersistPartial,
        }
    }
}

/// Disposal policy for partial output of a cancelled generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPolicy {
    /// Persist the partial text as a marked-incomplete message.
    PersistPartial,
    /// Drop the partial text; only the live event channel saw it.
    Discard,
}

impl AppConfig {
    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_defaults_are_sane() {
        let cfg = GenerationConfig::default();
        assert_eq!(cfg.max_tool_rounds, 10);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.on_cancel, CancellationPolicy::PersistPartial);
    }

    #[test]
    fn provider_kind_parses_snake_case() {
        let cfg: EndpointConfig = toml::from_str(
            r#"
            name = "corp-proxy"
            provider = "openai_compat"
            base_url = "https://llm.internal/v1"
            models = [{ id = "gpt-4o", context_window = 128000, max_output = 4096 }]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.provider, ProviderKind::OpenAiCompat);
        assert_eq!(cfg.models[0].context_window, 128_000);
    }
}
