//! Scripted transport used by the daemon's test suites. The mock query
//! behaves like the real transport seam: a lazy message stream, model
//! switching, interrupts, and file rewinds with configurable outcomes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use kai_core::ids::{CheckpointId, SessionId};
use kai_core::messages::SdkMessage;
use kai_core::query::{
    AgentQuery, QueryOptions, QueryTransport, RewindFilesResult, TransportError,
};

pub struct MockQuery {
    ready: AtomicBool,
    closed: AtomicBool,
    stream: Mutex<VecDeque<SdkMessage>>,
    notify: Notify,
    pub interrupt_calls: AtomicUsize,
    set_model_calls: Mutex<Vec<String>>,
    sent_messages: Mutex<Vec<String>>,
    rewind_result: Mutex<RewindFilesResult>,
    rewind_calls: Mutex<Vec<(CheckpointId, bool)>>,
    fail_set_model: AtomicBool,
}

impl Default for MockQuery {
    fn default() -> Self {
        Self::new()
    }
}

impl MockQuery {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            stream: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            interrupt_calls: AtomicUsize::new(0),
            set_model_calls: Mutex::new(Vec::new()),
            sent_messages: Mutex::new(Vec::new()),
            rewind_result: Mutex::new(RewindFilesResult {
                can_rewind: true,
                files_changed: Some(0),
                insertions: Some(0),
                deletions: Some(0),
                error: None,
            }),
            rewind_calls: Mutex::new(Vec::new()),
            fail_set_model: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_rewind_result(&self, result: RewindFilesResult) {
        *self.rewind_result.lock() = result;
    }

    pub fn fail_next_set_model(&self) {
        self.fail_set_model.store(true, Ordering::SeqCst);
    }

    /// Push a message into the stream; wakes any pending reader.
    pub fn push_message(&self, message: SdkMessage) {
        self.stream.lock().push_back(message);
        self.notify.notify_one();
    }

    /// Close the stream: readers drain what is queued, then get `None`.
    pub fn close_stream(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn set_model_calls(&self) -> Vec<String> {
        self.set_model_calls.lock().clone()
    }

    pub fn sent_messages(&self) -> Vec<String> {
        self.sent_messages.lock().clone()
    }

    pub fn rewind_calls(&self) -> Vec<(CheckpointId, bool)> {
        self.rewind_calls.lock().clone()
    }
}

#[async_trait]
impl AgentQuery for MockQuery {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn set_model(&self, model: &str) -> Result<(), TransportError> {
        if self.fail_set_model.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Rejected(format!("model {model} refused")));
        }
        self.set_model_calls.lock().push(model.to_string());
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), TransportError> {
        self.interrupt_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rewind_files(
        &self,
        checkpoint_id: &CheckpointId,
        dry_run: bool,
    ) -> Result<RewindFilesResult, TransportError> {
        self.rewind_calls.lock().push((checkpoint_id.clone(), dry_run));
        Ok(self.rewind_result.lock().clone())
    }

    async fn send_user_message(&self, content: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("stream closed".into()));
        }
        self.sent_messages.lock().push(content.to_string());
        Ok(())
    }

    async fn next_message(&self) -> Option<SdkMessage> {
        loop {
            if let Some(message) = self.stream.lock().pop_front() {
                return Some(message);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

/// Transport factory handing out `MockQuery` instances and recording every
/// start for inspection.
pub struct MockTransport {
    started: Mutex<Vec<(SessionId, QueryOptions, Arc<MockQuery>)>>,
    fail_start: AtomicBool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            started: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
        }
    }

    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> usize {
        self.started.lock().len()
    }

    pub fn last_query(&self) -> Option<Arc<MockQuery>> {
        self.started.lock().last().map(|(_, _, q)| q.clone())
    }

    pub fn last_options(&self) -> Option<QueryOptions> {
        self.started.lock().last().map(|(_, o, _)| o.clone())
    }
}

#[async_trait]
impl QueryTransport for MockTransport {
    async fn start_query(
        &self,
        session_id: &SessionId,
        options: QueryOptions,
    ) -> Result<Arc<dyn AgentQuery>, TransportError> {
        if self.fail_start.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Io("transport unavailable".into()));
        }
        let query = Arc::new(MockQuery::new());
        self.started
            .lock()
            .push((session_id.clone(), options, query.clone()));
        Ok(query)
    }
}
