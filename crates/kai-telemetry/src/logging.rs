use tracing_subscriber::EnvFilter;

/// Configuration for the tracing subscriber.
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Default directive when RUST_LOG is unset.
    pub default_directive: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            json: false,
        }
    }
}

/// Install the global tracing subscriber. RUST_LOG overrides the default
/// directive. Safe to call more than once; later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive.clone()));

    let result = if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}
