use std::collections::BTreeMap;

use kai_core::config::SessionConfig;

use crate::provider::{ModelInfo, ModelProvider, ModelTier, ProviderSdkConfig};

struct ModelEntry {
    id: &'static str,
    display_name: &'static str,
    aliases: &'static [&'static str],
    context_window: usize,
    supports_thinking: bool,
    tier: ModelTier,
}

static MODELS: &[ModelEntry] = &[
    ModelEntry {
        id: "claude-opus-4-6",
        display_name: "Claude Opus 4.6",
        aliases: &["opus"],
        context_window: 200_000,
        supports_thinking: true,
        tier: ModelTier::Powerful,
    },
    ModelEntry {
        id: "claude-sonnet-4-5-20250929",
        display_name: "Claude Sonnet 4.5",
        aliases: &["sonnet", "default"],
        context_window: 200_000,
        supports_thinking: true,
        tier: ModelTier::Balanced,
    },
    ModelEntry {
        id: "claude-haiku-4-5-20251001",
        display_name: "Claude Haiku 4.5",
        aliases: &["haiku"],
        context_window: 200_000,
        supports_thinking: true,
        tier: ModelTier::Fast,
    },
];

fn find_entry(model_id: &str) -> Option<&'static ModelEntry> {
    MODELS
        .iter()
        .find(|m| m.id == model_id || m.aliases.contains(&model_id))
}

/// The Anthropic model family. `default` is an alias for the balanced tier.
pub struct AnthropicProvider {
    available: bool,
}

impl AnthropicProvider {
    pub fn new(available: bool) -> Self {
        Self { available }
    }

    /// Availability from credential discovery in the process env.
    pub fn from_env() -> Self {
        Self {
            available: std::env::var("ANTHROPIC_API_KEY").is_ok(),
        }
    }
}

impl ModelProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn display_name(&self) -> &str {
        "Anthropic"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn owns_model(&self, model_id: &str) -> bool {
        find_entry(model_id).is_some() || model_id.starts_with("claude-")
    }

    fn get_models(&self) -> Vec<ModelInfo> {
        MODELS
            .iter()
            .map(|m| ModelInfo {
                id: m.id.to_string(),
                display_name: m.display_name.to_string(),
                provider_id: self.id().to_string(),
                aliases: m.aliases.iter().map(|a| a.to_string()).collect(),
                context_window: m.context_window,
                supports_thinking: m.supports_thinking,
                tier: Some(m.tier),
            })
            .collect()
    }

    fn build_sdk_config(
        &self,
        _model_id: &str,
        session_config: Option<&SessionConfig>,
    ) -> ProviderSdkConfig {
        let mut env = BTreeMap::new();
        if let Some(provider_config) = session_config.and_then(|c| c.provider_config.as_ref()) {
            if let Some(api_key) = &provider_config.api_key {
                env.insert("ANTHROPIC_API_KEY".to_string(), api_key.clone());
            }
            if let Some(base_url) = &provider_config.base_url {
                env.insert("ANTHROPIC_BASE_URL".to_string(), base_url.clone());
            }
        }
        ProviderSdkConfig { env }
    }

    fn translate_model_id_for_sdk(&self, model_id: &str) -> Option<String> {
        find_entry(model_id).and_then(|m| {
            if m.id == model_id {
                None
            } else {
                Some(m.id.to_string())
            }
        })
    }

    fn get_model_for_tier(&self, tier: ModelTier) -> Option<String> {
        MODELS
            .iter()
            .find(|m| m.tier == tier)
            .map(|m| m.id.to_string())
    }
}
