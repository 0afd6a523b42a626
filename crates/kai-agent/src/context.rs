use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Context usage for one session, reported through `session.get` and the
/// unified state channel.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<usize>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub message_count: u64,
}

/// Tracks the active model and accumulated token usage.
#[derive(Debug, Default)]
pub struct ContextTracker {
    inner: Mutex<ContextInfo>,
}

impl ContextTracker {
    pub fn new(model: &str) -> Self {
        Self {
            inner: Mutex::new(ContextInfo {
                model: model.to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn set_model(&self, model: &str, context_window: Option<usize>) {
        let mut inner = self.inner.lock();
        inner.model = model.to_string();
        inner.context_window = context_window;
    }

    pub fn record_usage(&self, input_tokens: u64, output_tokens: u64) {
        let mut inner = self.inner.lock();
        inner.input_tokens += input_tokens;
        inner.output_tokens += output_tokens;
    }

    pub fn record_message(&self) {
        self.inner.lock().message_count += 1;
    }

    pub fn info(&self) -> ContextInfo {
        self.inner.lock().clone()
    }
}
