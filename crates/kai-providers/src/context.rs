use std::sync::Arc;

use serde::Serialize;

use kai_core::config::SessionConfig;
use kai_core::query::QueryOptions;

use crate::error::ProviderError;
use crate::provider::ModelProvider;
use crate::registry::ProviderRegistry;

/// A session's resolved provider binding.
pub struct ProviderContext {
    provider: Arc<dyn ModelProvider>,
    model: String,
}

impl std::fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContext")
            .field("model", &self.model)
            .finish()
    }
}

/// Select the provider for a session: an explicit `config.provider` wins
/// when it is registered; otherwise the first provider owning the session's
/// model; otherwise the first registered provider.
pub fn create_context(
    registry: &ProviderRegistry,
    config: &SessionConfig,
) -> Result<ProviderContext, ProviderError> {
    if registry.is_empty() {
        return Err(ProviderError::NoProviderAvailable);
    }

    let model = if config.model.is_empty() {
        "default".to_string()
    } else {
        config.model.clone()
    };

    let provider = config
        .provider
        .as_deref()
        .and_then(|id| registry.get(id))
        .or_else(|| registry.detect_provider(&model))
        .or_else(|| registry.first())
        .ok_or(ProviderError::NoProviderAvailable)?;

    Ok(ProviderContext { provider, model })
}

impl ProviderContext {
    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    pub fn provider(&self) -> &Arc<dyn ModelProvider> {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// The id the transport should see: the provider's translation when it
    /// has one, else the model id unchanged.
    pub fn sdk_model_id(&self) -> String {
        self.provider
            .translate_model_id_for_sdk(&self.model)
            .unwrap_or_else(|| self.model.clone())
    }

    /// Overlay provider concerns onto composed base options: swap in the
    /// SDK model id and merge the provider env over the base env. When both
    /// are empty the env field stays unset entirely.
    pub fn build_sdk_options(
        &self,
        mut base: QueryOptions,
        config: Option<&SessionConfig>,
    ) -> QueryOptions {
        base.model = self.sdk_model_id();

        let provider_env = self.provider.build_sdk_config(&self.model, config).env;
        let mut merged = base.env.take().unwrap_or_default();
        merged.extend(provider_env);
        base.env = if merged.is_empty() { None } else { Some(merged) };

        base
    }

    /// A model switch needs a query restart when the new id resolves to a
    /// different provider, or cannot be resolved at all.
    pub fn requires_query_restart(&self, registry: &ProviderRegistry, new_model_id: &str) -> bool {
        match registry.detect_provider(new_model_id) {
            Some(detected) => detected.id() != self.provider.id(),
            None => true,
        }
    }
}

/// Result of validating a provider switch request.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A switch is valid when the target provider is registered and either
/// reports itself available or the caller supplies an api key.
pub fn validate_provider_switch(
    registry: &ProviderRegistry,
    provider_id: &str,
    api_key: Option<&str>,
) -> SwitchValidation {
    let Some(provider) = registry.get(provider_id) else {
        return SwitchValidation {
            valid: false,
            error: Some(ProviderError::UnknownProvider(provider_id.to_string()).to_string()),
        };
    };

    if provider.is_available() || api_key.is_some() {
        SwitchValidation {
            valid: true,
            error: None,
        }
    } else {
        SwitchValidation {
            valid: false,
            error: Some(ProviderError::NotAvailable(provider_id.to_string()).to_string()),
        }
    }
}
