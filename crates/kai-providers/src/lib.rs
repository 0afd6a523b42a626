//! Provider registry and SDK option composition: which provider owns a
//! model id, how its credentials reach the transport env, and when a model
//! switch forces a query restart.

mod anthropic;
mod context;
mod error;
mod provider;
mod registry;

pub mod mock;

pub use anthropic::AnthropicProvider;
pub use context::{create_context, validate_provider_switch, ProviderContext, SwitchValidation};
pub use error::ProviderError;
pub use provider::{ModelInfo, ModelProvider, ModelTier, ProviderSdkConfig};
pub use registry::{
    collect_models, global_registry, is_known_model, models_cache, ModelsCache, ProviderRegistry,
};
