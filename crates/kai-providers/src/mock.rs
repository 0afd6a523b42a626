//! Mock provider variants for tests. Just more implementations of
//! `ModelProvider`; nothing here is test-gated because downstream crates use
//! them in their own test suites.

use std::collections::BTreeMap;

use kai_core::config::SessionConfig;

use crate::provider::{ModelInfo, ModelProvider, ModelTier, ProviderSdkConfig};

pub struct MockProvider {
    id: String,
    available: bool,
    models: Vec<ModelInfo>,
    env: BTreeMap<String, String>,
    translations: BTreeMap<String, String>,
}

impl MockProvider {
    /// A provider owning the given model ids.
    pub fn new(id: &str, model_ids: &[&str]) -> Self {
        let models = model_ids
            .iter()
            .map(|m| ModelInfo {
                id: m.to_string(),
                display_name: m.to_string(),
                provider_id: id.to_string(),
                aliases: vec![],
                context_window: 100_000,
                supports_thinking: false,
                tier: None,
            })
            .collect();
        Self {
            id: id.to_string(),
            available: true,
            models,
            env: BTreeMap::new(),
            translations: BTreeMap::new(),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_translation(mut self, from: &str, to: &str) -> Self {
        self.translations.insert(from.to_string(), to.to_string());
        self
    }
}

impl ModelProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.id
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn owns_model(&self, model_id: &str) -> bool {
        self.models.iter().any(|m| m.id == model_id)
            || self.translations.contains_key(model_id)
    }

    fn get_models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    fn build_sdk_config(
        &self,
        _model_id: &str,
        _session_config: Option<&SessionConfig>,
    ) -> ProviderSdkConfig {
        ProviderSdkConfig {
            env: self.env.clone(),
        }
    }

    fn translate_model_id_for_sdk(&self, model_id: &str) -> Option<String> {
        self.translations.get(model_id).cloned()
    }

    fn get_model_for_tier(&self, _tier: ModelTier) -> Option<String> {
        self.models.first().map(|m| m.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_owns_configured_models() {
        let mock = MockProvider::new("mock", &["m1", "m2"]);
        assert!(mock.owns_model("m1"));
        assert!(!mock.owns_model("m3"));
        assert!(mock.is_available());
    }

    #[test]
    fn unavailable_builder() {
        let mock = MockProvider::new("mock", &["m1"]).unavailable();
        assert!(!mock.is_available());
    }

    #[test]
    fn env_and_translation_builders() {
        let mock = MockProvider::new("mock", &["m1"])
            .with_env("MOCK_KEY", "v")
            .with_translation("alias", "m1");
        assert_eq!(
            mock.build_sdk_config("m1", None).env.get("MOCK_KEY").unwrap(),
            "v"
        );
        assert_eq!(mock.translate_model_id_for_sdk("alias").as_deref(), Some("m1"));
        assert!(mock.owns_model("alias"));
    }
}
