use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kai_core::config::SessionConfig;

/// Rough capability class used when a caller asks for "a fast model" rather
/// than a specific id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    Balanced,
    Powerful,
}

/// A model as advertised by its provider. `id` is canonical; aliases are
/// accepted on input and translated before reaching the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    pub context_window: usize,
    pub supports_thinking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<ModelTier>,
}

/// Environment composition a provider contributes to query options.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProviderSdkConfig {
    pub env: BTreeMap<String, String>,
}

/// Capability set implemented by each provider. Concrete providers and the
/// mock variants used in tests are all just implementations of this trait;
/// the registry stores them behind `Arc<dyn ModelProvider>` keyed by id.
pub trait ModelProvider: Send + Sync {
    fn id(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Whether the provider can serve queries right now (credentials
    /// discovered, endpoint reachable enough to try).
    fn is_available(&self) -> bool;

    /// Whether this provider recognizes the model id (canonical or alias).
    fn owns_model(&self, model_id: &str) -> bool;

    fn get_models(&self) -> Vec<ModelInfo>;

    /// Provider-specific transport env for a model/session combination.
    fn build_sdk_config(
        &self,
        model_id: &str,
        session_config: Option<&SessionConfig>,
    ) -> ProviderSdkConfig;

    /// Translate an alias to the id the transport expects. `None` means the
    /// id passes through unchanged.
    fn translate_model_id_for_sdk(&self, _model_id: &str) -> Option<String> {
        None
    }

    /// Pick this provider's model for a capability tier.
    fn get_model_for_tier(&self, tier: ModelTier) -> Option<String>;
}
