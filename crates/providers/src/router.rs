//! Provider router: resolves a provider name to its transport.
//!
//! Built once from configuration and shared read-only across sessions.

use ironloop_config::ConfigError;
use ironloop_core::provider::ChatTransport;
use std::collections::HashMap;
use std::sync::Arc;

use crate::openai_compat::OpenAiCompatTransport;

/// Routes chat requests to the correct transport.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn ChatTransport>>,
    default_provider: String,
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("default_provider", &self.default_provider)
            .finish()
    }
}

impl ProviderRouter {
    /// Create a new router with a default provider.
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Register a transport under a name.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn ChatTransport>) {
        self.providers.insert(name.into(), provider);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn ChatTransport>) -> Self {
        self.register(name, provider);
        self
    }

    /// Get the default provider.
    pub fn default(&self) -> Option<Arc<dyn ChatTransport>> {
        self.providers.get(&self.default_provider).cloned()
    }

    pub fn default_name(&self) -> &str {
        &self.default_provider
    }

    /// Get a specific provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatTransport>> {
        self.providers.get(name).cloned()
    }

    /// A named provider, or the default one when no name is given.
    pub fn resolve(&self, name: Option<&str>) -> Option<(String, Arc<dyn ChatTransport>)> {
        let name = name.unwrap_or(&self.default_provider);
        self.get(name).map(|p| (name.to_string(), p))
    }

    /// List all registered provider names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Build transports from configuration.
///
/// A provider without `api_url` must be one with a known endpoint.
pub fn build_from_config(config: &ironloop_config::AppConfig) -> Result<ProviderRouter, ConfigError> {
    let mut router = ProviderRouter::new(&config.default_provider);

    for (name, provider_config) in &config.providers {
        let api_key = config.api_key_for(name).unwrap_or_default();
        let base_url = match &provider_config.api_url {
            Some(url) => url.clone(),
            None => default_base_url(name)?.to_string(),
        };

        router.register(
            name.clone(),
            Arc::new(OpenAiCompatTransport::new(name, &base_url, &api_key)),
        );
    }

    // Ensure the default provider exists (even if not explicitly configured)
    if router.get(&config.default_provider).is_none() {
        let api_key = config.api_key.clone().unwrap_or_default();
        let base_url = default_base_url(&config.default_provider)?;
        router.register(
            config.default_provider.clone(),
            Arc::new(OpenAiCompatTransport::new(
                &config.default_provider,
                base_url,
                &api_key,
            )),
        );
    }

    tracing::debug!(providers = ?router.list(), default = %config.default_provider, "Provider router built");
    Ok(router)
}

/// Base URL for well-known providers. Any other provider needs `api_url`.
fn default_base_url(provider_name: &str) -> Result<&'static str, ConfigError> {
    let url = match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1",
        "openai" => "https://api.openai.com/v1",
        "ollama" => "http://localhost:11434/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "together" => "https://api.together.xyz/v1",
        "vllm" => "http://localhost:8000/v1",
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1",
        _ => {
            return Err(ConfigError::ValidationError(format!(
                "provider '{provider_name}' has no api_url and no known default endpoint"
            )));
        }
    };
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedTransport;
    use ironloop_config::{AppConfig, ProviderConfig};

    #[test]
    fn router_register_and_lookup() {
        let mut router = ProviderRouter::new("openrouter");
        router.register("openrouter", Arc::new(OpenAiCompatTransport::openrouter("sk-test")));

        assert!(router.get("openrouter").is_some());
        assert!(router.get("nonexistent").is_none());
        assert!(router.default().is_some());
    }

    #[test]
    fn resolve_falls_back_to_default() {
        let router = ProviderRouter::new("scripted")
            .with_provider("scripted", Arc::new(ScriptedTransport::new(vec![])))
            .with_provider("other", Arc::new(ScriptedTransport::named("other", vec![])));

        let (name, transport) = router.resolve(None).unwrap();
        assert_eq!(name, "scripted");
        assert_eq!(transport.name(), "scripted");

        let (name, _) = router.resolve(Some("other")).unwrap();
        assert_eq!(name, "other");
        assert!(router.resolve(Some("missing")).is_none());
        assert_eq!(router.list(), vec!["other", "scripted"]);
    }

    #[test]
    fn default_base_urls() {
        assert!(default_base_url("openrouter").unwrap().contains("openrouter.ai"));
        assert!(default_base_url("openai").unwrap().contains("api.openai.com"));
        assert!(default_base_url("ollama").unwrap().contains("localhost:11434"));
        assert!(default_base_url("acme").is_err());
    }

    #[test]
    fn build_from_default_config() {
        let router = build_from_config(&AppConfig::default()).unwrap();
        assert!(router.default().is_some());
        assert_eq!(router.default_name(), "openrouter");
    }

    #[test]
    fn build_registers_configured_providers() {
        let mut config = AppConfig::default();
        config.providers.insert(
            "ollama".into(),
            ProviderConfig {
                api_key: None,
                api_url: Some("http://gpu-box:11434/v1".into()),
                default_model: None,
            },
        );
        let router = build_from_config(&config).unwrap();
        assert_eq!(router.list(), vec!["ollama", "openrouter"]);
        assert_eq!(router.get("ollama").unwrap().name(), "ollama");
    }

    #[test]
    fn unknown_provider_without_url_is_rejected() {
        let mut config = AppConfig::default();
        config.providers.insert(
            "acme".into(),
            ProviderConfig {
                api_key: None,
                api_url: None,
                default_model: None,
            },
        );
        let err = build_from_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(ref msg) if msg.contains("acme")));

        config.providers.get_mut("acme").unwrap().api_url = Some("https://llm.acme.test/v1".into());
        assert!(build_from_config(&config).unwrap().get("acme").is_some());
    }
}
