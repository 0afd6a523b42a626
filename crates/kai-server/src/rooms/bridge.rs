use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use kai_core::ids::{ClientId, PairId, SessionId};
use kai_core::messages::SdkMessageType;
use kai_core::state::ProcessingState;
use kai_core::topics;
use kai_hub::{ChannelSubscription, MessageHub};
use kai_store::messages::SdkMessageRepo;
use kai_store::rooms::{PairRepo, PairStatus, SessionPairRow};
use kai_store::sessions::SessionRepo;
use kai_store::{Database, StoreError};

const WORKER_PREFIX: &str = "[Worker Update]\n\n";
const MANAGER_PREFIX: &str = "[Manager Response]\n\n";
const MAX_WORKER_RETRIES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    WorkerToManager,
    ManagerToWorker,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::WorkerToManager => "worker-to-manager",
            Self::ManagerToWorker => "manager-to-worker",
        }
    }
}

struct BridgeHandle {
    cancel: CancellationToken,
    worker_client: ClientId,
    manager_client: ClientId,
    worker_channel: String,
    manager_channel: String,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Couples each pair's worker and manager sessions: watches their unified
/// state on the hub and forwards output when a side comes to rest. Bridges
/// hold pair ids, never live session objects.
pub struct BridgeManager {
    db: Database,
    hub: Arc<MessageHub>,
    bridges: DashMap<PairId, Arc<BridgeHandle>>,
}

impl BridgeManager {
    pub fn new(db: Database, hub: Arc<MessageHub>) -> Arc<Self> {
        Arc::new(Self {
            db,
            hub,
            bridges: DashMap::new(),
        })
    }

    pub fn is_running(&self, pair_id: &PairId) -> bool {
        self.bridges.contains_key(pair_id)
    }

    /// Start the bridge for a pair. Idempotent: a second start while
    /// running returns `false`. Initial state fetches are best-effort;
    /// fetch failures leave the bridge active and waiting on events.
    pub async fn start_bridge(self: Arc<Self>, pair_id: &PairId) -> Result<bool, StoreError> {
        if self.bridges.contains_key(pair_id) {
            return Ok(false);
        }

        let pair = PairRepo::new(self.db.clone()).get(pair_id)?;

        let worker_client = ClientId::new();
        let manager_client = ClientId::new();
        let worker_channel = topics::session_channel(&pair.worker_session_id);
        let manager_channel = topics::session_channel(&pair.manager_session_id);

        let worker_sub = self.hub.join_channel(&worker_channel, &worker_client);
        let manager_sub = self.hub.join_channel(&manager_channel, &manager_client);

        let worker_baseline = self.fetch_terminal(&pair.worker_session_id).await;
        let manager_baseline = self.fetch_terminal(&pair.manager_session_id).await;

        let cancel = CancellationToken::new();
        let handle = Arc::new(BridgeHandle {
            cancel: cancel.clone(),
            worker_client,
            manager_client,
            worker_channel,
            manager_channel,
            tasks: Mutex::new(Vec::new()),
        });

        let worker_task = tokio::spawn(Self::watch_side(
            Arc::clone(&self),
            pair.clone(),
            Direction::WorkerToManager,
            worker_sub,
            worker_baseline,
            cancel.clone(),
        ));
        let manager_task = tokio::spawn(Self::watch_side(
            Arc::clone(&self),
            pair.clone(),
            Direction::ManagerToWorker,
            manager_sub,
            manager_baseline,
            cancel,
        ));
        handle.tasks.lock().push(worker_task);
        handle.tasks.lock().push(manager_task);

        self.bridges.insert(pair_id.clone(), handle);
        tracing::info!(pair_id = %pair_id, "bridge started");
        Ok(true)
    }

    /// Best-effort initial state fetch; failures are swallowed and the side
    /// is treated as not-yet-terminal so the first terminal event forwards.
    async fn fetch_terminal(&self, session_id: &SessionId) -> bool {
        match self
            .hub
            .request(
                topics::STATE_SESSION,
                json!({"sessionId": session_id.to_string()}),
                None,
            )
            .await
        {
            Ok(state) => serde_json::from_value::<ProcessingState>(state["agentState"].clone())
                .map(|s| s.is_terminal())
                .unwrap_or(false),
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "initial state fetch failed");
                false
            }
        }
    }

    pub fn stop_bridge(&self, pair_id: &PairId) -> bool {
        let Some((_, handle)) = self.bridges.remove(pair_id) else {
            return false;
        };
        handle.cancel.cancel();
        for task in handle.tasks.lock().drain(..) {
            task.abort();
        }
        self.hub
            .leave_channel(&handle.worker_channel, &handle.worker_client);
        self.hub
            .leave_channel(&handle.manager_channel, &handle.manager_client);
        tracing::info!(pair_id = %pair_id, "bridge stopped");
        true
    }

    pub fn stop_all_bridges(&self) {
        let pair_ids: Vec<PairId> = self.bridges.iter().map(|e| e.key().clone()).collect();
        for pair_id in pair_ids {
            self.stop_bridge(&pair_id);
        }
    }

    async fn watch_side(
        this: Arc<Self>,
        pair: SessionPairRow,
        direction: Direction,
        mut sub: ChannelSubscription,
        baseline_terminal: bool,
        cancel: CancellationToken,
    ) {
        let mut last_terminal = baseline_terminal;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = sub.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if event.topic != topics::STATE_SESSION {
                continue;
            }

            let Ok(state) =
                serde_json::from_value::<ProcessingState>(event.data["state"].clone())
            else {
                continue;
            };
            let error = event
                .data
                .get("error")
                .and_then(|e| e.as_str())
                .map(str::to_string);

            let terminal = state.is_terminal();
            if terminal && !last_terminal {
                this.on_terminal(&pair, direction, &state, error).await;
            }
            last_terminal = terminal;
        }
    }

    async fn on_terminal(
        &self,
        pair: &SessionPairRow,
        direction: Direction,
        state: &ProcessingState,
        error: Option<String>,
    ) {
        // Worker errors take the crash path instead of forwarding.
        if direction == Direction::WorkerToManager {
            if let Some(error) = error {
                self.on_worker_crash(pair, &error).await;
                return;
            }
        }

        let (source, target, terminal_topic, prefix) = match direction {
            Direction::WorkerToManager => (
                &pair.worker_session_id,
                &pair.manager_session_id,
                topics::BRIDGE_WORKER_TERMINAL,
                WORKER_PREFIX,
            ),
            Direction::ManagerToWorker => (
                &pair.manager_session_id,
                &pair.worker_session_id,
                topics::BRIDGE_MANAGER_TERMINAL,
                MANAGER_PREFIX,
            ),
        };

        self.hub.event(
            terminal_topic,
            json!({
                "sessionId": source.to_string(),
                "pairId": pair.id.to_string(),
                "agentState": state,
            }),
        );

        let messages = match SdkMessageRepo::new(self.db.clone())
            .list_by_type(source, SdkMessageType::Assistant)
        {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(pair_id = %pair.id, error = %e, "failed to read messages for forwarding");
                return;
            }
        };

        let texts: Vec<String> = messages
            .iter()
            .map(|m| m.text())
            .filter(|t| !t.is_empty())
            .collect();
        if texts.is_empty() {
            return;
        }
        let count = texts.len();
        let content = format!("{prefix}{}", texts.join("\n"));

        self.send_message(target, &content).await;
        self.hub.event(
            topics::BRIDGE_MESSAGES_FORWARDED,
            json!({
                "pairId": pair.id.to_string(),
                "direction": direction.as_str(),
                "count": count,
            }),
        );
    }

    async fn on_worker_crash(&self, pair: &SessionPairRow, error: &str) {
        let retry_count = SessionRepo::new(self.db.clone())
            .get(&pair.worker_session_id)
            .map(|s| s.metadata.recovery_context.retry_count)
            .unwrap_or(MAX_WORKER_RETRIES);

        if retry_count < MAX_WORKER_RETRIES {
            // Recoverable: tell the manager and leave the retry decision to
            // the room agent.
            self.send_message(
                &pair.manager_session_id,
                &format!("Worker session encountered an error and may be retried: {error}"),
            )
            .await;
            return;
        }

        self.send_message(
            &pair.manager_session_id,
            &format!("Worker session could not be recovered: {error}"),
        )
        .await;
        if let Err(e) = PairRepo::new(self.db.clone()).update_status(&pair.id, PairStatus::Crashed)
        {
            tracing::error!(pair_id = %pair.id, error = %e, "failed to mark pair crashed");
        }
        self.stop_bridge(&pair.id);
    }

    async fn send_message(&self, session_id: &SessionId, content: &str) {
        if let Err(e) = self
            .hub
            .request(
                "message.send",
                json!({"sessionId": session_id.to_string(), "content": content}),
                None,
            )
            .await
        {
            tracing::warn!(session_id = %session_id, error = %e, "bridge message send failed");
        }
    }
}
