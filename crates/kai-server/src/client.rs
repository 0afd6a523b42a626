use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use kai_core::ids::ClientId;
use kai_hub::MessageHub;

/// A connected WebSocket client: a bounded outbound queue plus the
/// forwarder tasks that pump its joined hub channels into that queue.
struct ClientEntry {
    tx: mpsc::Sender<String>,
    forwarders: Mutex<Vec<(String, tokio::task::JoinHandle<()>)>>,
}

/// Connected-client bookkeeping. On disconnect the hub keeps nothing for
/// the client; it re-joins channels and refreshes via snapshots on
/// reconnect.
pub struct ClientRegistry {
    hub: Arc<MessageHub>,
    clients: DashMap<ClientId, Arc<ClientEntry>>,
    queue_capacity: usize,
}

impl ClientRegistry {
    pub fn new(hub: Arc<MessageHub>, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            hub,
            clients: DashMap::new(),
            queue_capacity,
        })
    }

    /// Register a new connection; the receiver feeds the socket writer.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let client_id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.clients.insert(
            client_id.clone(),
            Arc::new(ClientEntry {
                tx,
                forwarders: Mutex::new(Vec::new()),
            }),
        );
        (client_id, rx)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Queue a frame for one client. Full queues drop the frame; the
    /// client reconciles through the snapshot channels.
    pub fn send_to(&self, client_id: &ClientId, frame: String) {
        if let Some(entry) = self.clients.get(client_id) {
            if entry.tx.try_send(frame).is_err() {
                tracing::warn!(client_id = %client_id, "client queue full, frame dropped");
            }
        }
    }

    /// Join a hub channel on behalf of the client and pump its events into
    /// the outbound queue.
    pub fn join(&self, client_id: &ClientId, channel: &str) {
        let Some(entry) = self.clients.get(client_id).map(|e| Arc::clone(&e)) else {
            return;
        };

        let mut sub = self.hub.join_channel(channel, client_id);
        let tx = entry.tx.clone();
        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                let Ok(frame) = serde_json::to_string(&event) else {
                    continue;
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
        entry.forwarders.lock().push((channel_name, task));
    }

    pub fn leave(&self, client_id: &ClientId, channel: &str) {
        self.hub.leave_channel(channel, client_id);
        if let Some(entry) = self.clients.get(client_id) {
            let mut forwarders = entry.forwarders.lock();
            forwarders.retain(|(name, task)| {
                if name == channel {
                    task.abort();
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Drop the client and everything it joined.
    pub fn disconnect(&self, client_id: &ClientId) {
        self.hub.disconnect(client_id);
        if let Some((_, entry)) = self.clients.remove(client_id) {
            for (_, task) in entry.forwarders.lock().drain(..) {
                task.abort();
            }
        }
    }
}

/// Token-bucket rate limiter keyed by client.
pub struct RateLimiter {
    buckets: DashMap<ClientId, Mutex<TokenBucket>>,
    max_tokens: u32,
    refill_rate: f64,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(max_tokens: u32, refill_rate: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            max_tokens,
            refill_rate,
        }
    }

    /// Try to consume one token. Returns `true` when the request may pass.
    pub fn check(&self, client_id: &ClientId) -> bool {
        let max = self.max_tokens;
        let rate = self.refill_rate;
        let entry = self.buckets.entry(client_id.clone()).or_insert_with(|| {
            Mutex::new(TokenBucket {
                tokens: max as f64,
                last_refill: Instant::now(),
            })
        });

        let mut bucket = entry.value().lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(max as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn remove(&self, client_id: &ClientId) {
        self.buckets.remove(client_id);
    }
}
