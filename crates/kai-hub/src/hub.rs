use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use kai_core::ids::{ClientId, SessionId};
use kai_core::topics;

use crate::error::HubError;

/// Context carried with a request (the connection it arrived on, if any).
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub client_id: Option<ClientId>,
}

/// An event delivered on a channel. The envelope carries the per-channel
/// monotonic version; snapshot handlers report the same counter so clients
/// can discard deltas at or below their last snapshot.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEvent {
    pub channel: String,
    pub topic: String,
    pub data: Value,
    pub version: u64,
    pub timestamp: String,
}

/// An event on the global in-process bus.
#[derive(Clone, Debug)]
pub struct BusEvent {
    pub topic: String,
    pub data: Value,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HubError>> + Send>>;
type Handler = Arc<dyn Fn(Value, RequestContext) -> HandlerFuture + Send + Sync>;

/// Per-channel state. The lock covers the subscriber set and the version
/// counter; delivery pushes into unbounded queues, so holding it across the
/// sends is non-blocking and is what makes delivery totally ordered per
/// channel. Subscriber code runs in its own task on the receiving side,
/// never under this lock.
struct Channel {
    inner: Mutex<ChannelInner>,
}

struct ChannelInner {
    version: u64,
    subscribers: HashMap<ClientId, mpsc::UnboundedSender<ChannelEvent>>,
}

impl Channel {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                version: 0,
                subscribers: HashMap::new(),
            }),
        }
    }
}

/// A joined channel. Dropping the subscription (or calling `leave_channel`)
/// stops delivery; the hub keeps no queue for departed clients.
pub struct ChannelSubscription {
    pub channel: String,
    pub client_id: ClientId,
    receiver: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelSubscription {
    /// Next event on this channel. `None` after leaving the channel.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.receiver.try_recv().ok()
    }
}

/// In-process request/reply + publish/subscribe fabric.
pub struct MessageHub {
    handlers: DashMap<String, Handler>,
    channels: DashMap<String, Arc<Channel>>,
    bus: broadcast::Sender<BusEvent>,
}

impl Default for MessageHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHub {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self {
            handlers: DashMap::new(),
            channels: DashMap::new(),
            bus,
        }
    }

    // ── Request/Reply ──

    /// Register the handler for a method. Exactly one handler per method:
    /// registering again replaces the previous one.
    pub fn on_request<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HubError>> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(move |data, ctx| Box::pin(handler(data, ctx)));
        if self.handlers.insert(method.to_string(), wrapped).is_some() {
            tracing::warn!(method, "request handler replaced");
        }
    }

    /// Deliver a request to the registered handler and await its reply.
    pub async fn request(
        &self,
        method: &str,
        data: Value,
        ctx: Option<RequestContext>,
    ) -> Result<Value, HubError> {
        let handler = self
            .handlers
            .get(method)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HubError::MethodNotFound(method.to_string()))?;

        handler(data, ctx.unwrap_or_default()).await
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    // ── Channels ──

    fn channel(&self, name: &str) -> Arc<Channel> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Channel::new()))
            .clone()
    }

    /// Join a channel. A client holds at most one subscription per channel;
    /// re-joining replaces the previous one.
    pub fn join_channel(&self, name: &str, client_id: &ClientId) -> ChannelSubscription {
        let channel = self.channel(name);
        let (tx, rx) = mpsc::unbounded_channel();
        channel.inner.lock().subscribers.insert(client_id.clone(), tx);
        ChannelSubscription {
            channel: name.to_string(),
            client_id: client_id.clone(),
            receiver: rx,
        }
    }

    pub fn leave_channel(&self, name: &str, client_id: &ClientId) {
        if let Some(channel) = self.channels.get(name) {
            channel.inner.lock().subscribers.remove(client_id);
        }
    }

    /// Remove a client from every channel. Nothing is retained for it.
    pub fn disconnect(&self, client_id: &ClientId) {
        for entry in self.channels.iter() {
            entry.value().inner.lock().subscribers.remove(client_id);
        }
    }

    /// Current version of a channel (0 before any publish).
    pub fn channel_version(&self, name: &str) -> u64 {
        self.channels
            .get(name)
            .map(|c| c.inner.lock().version)
            .unwrap_or(0)
    }

    /// Publish an event. With a session id it goes to `session:{id}`,
    /// otherwise to `global`. Returns the version assigned to the event.
    /// Never fails visibly; subscribers that are gone are skipped.
    pub fn publish(&self, topic: &str, data: Value, session_id: Option<&SessionId>) -> u64 {
        let channel_name = match session_id {
            Some(id) => topics::session_channel(id),
            None => topics::GLOBAL_CHANNEL.to_string(),
        };
        self.publish_to_channel(&channel_name, topic, data)
    }

    /// Publish on an explicit channel name.
    pub fn publish_to_channel(&self, channel_name: &str, topic: &str, data: Value) -> u64 {
        let channel = self.channel(channel_name);
        let mut inner = channel.inner.lock();
        inner.version += 1;
        let event = ChannelEvent {
            channel: channel_name.to_string(),
            topic: topic.to_string(),
            data,
            version: inner.version,
            timestamp: Utc::now().to_rfc3339(),
        };

        let mut dead = Vec::new();
        for (client_id, tx) in inner.subscribers.iter() {
            if tx.send(event.clone()).is_err() {
                dead.push(client_id.clone());
            }
        }
        for client_id in dead {
            tracing::debug!(channel = channel_name, client_id = %client_id, "dropping dead subscriber");
            inner.subscribers.remove(&client_id);
        }
        event.version
    }

    // ── Event bus ──

    /// Global broadcast: delivered to the in-process bus and published on
    /// the `global` channel for connected clients.
    pub fn event(&self, topic: &str, data: Value) {
        self.publish_to_channel(topics::GLOBAL_CHANNEL, topic, data.clone());
        if self
            .bus
            .send(BusEvent {
                topic: topic.to_string(),
                data,
            })
            .is_err()
        {
            tracing::debug!(topic, "no bus subscribers for event");
        }
    }

    /// Subscribe to the in-process bus (internal components).
    pub fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hub() -> Arc<MessageHub> {
        Arc::new(MessageHub::new())
    }

    #[tokio::test]
    async fn request_reply_roundtrip() {
        let hub = hub();
        hub.on_request("math.double", |data, _ctx| async move {
            let n = data.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(json!({"result": n * 2}))
        });

        let reply = hub.request("math.double", json!({"n": 21}), None).await.unwrap();
        assert_eq!(reply["result"], 42);
    }

    #[tokio::test]
    async fn unregistered_method_fails() {
        let hub = hub();
        let result = hub.request("nope", json!({}), None).await;
        assert!(matches!(result, Err(HubError::MethodNotFound(_))));
        assert_eq!(
            result.unwrap_err().to_string(),
            "Method not found: nope"
        );
    }

    #[tokio::test]
    async fn handler_error_propagates() {
        let hub = hub();
        hub.on_request("always.fails", |_data, _ctx| async move {
            Err(HubError::NotFound("Session not found".into()))
        });
        let err = hub.request("always.fails", json!({}), None).await.unwrap_err();
        assert_eq!(err.to_string(), "Session not found");
    }

    #[tokio::test]
    async fn second_registration_replaces_first() {
        let hub = hub();
        hub.on_request("m", |_d, _c| async move { Ok(json!({"v": 1})) });
        hub.on_request("m", |_d, _c| async move { Ok(json!({"v": 2})) });
        let reply = hub.request("m", json!({}), None).await.unwrap();
        assert_eq!(reply["v"], 2);
    }

    #[tokio::test]
    async fn request_context_carries_client() {
        let hub = hub();
        hub.on_request("who", |_d, ctx| async move {
            Ok(json!({"client": ctx.client_id.map(|c| c.to_string())}))
        });

        let client = ClientId::from_raw("client_1");
        let reply = hub
            .request(
                "who",
                json!({}),
                Some(RequestContext {
                    client_id: Some(client),
                }),
            )
            .await
            .unwrap();
        assert_eq!(reply["client"], "client_1");
    }

    #[tokio::test]
    async fn publish_reaches_joined_subscriber() {
        let hub = hub();
        let client = ClientId::new();
        let session = SessionId::new();
        let mut sub = hub.join_channel(&topics::session_channel(&session), &client);

        hub.publish("session.updated", json!({"title": "t"}), Some(&session));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.topic, "session.updated");
        assert_eq!(event.data["title"], "t");
        assert_eq!(event.version, 1);
    }

    #[tokio::test]
    async fn publish_without_session_goes_to_global() {
        let hub = hub();
        let client = ClientId::new();
        let mut global = hub.join_channel(topics::GLOBAL_CHANNEL, &client);
        let mut session_sub =
            hub.join_channel(&topics::session_channel(&SessionId::new()), &client);

        hub.publish("announce", json!({}), None);

        assert!(global.recv().await.is_some());
        assert!(session_sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn channel_order_preserved() {
        let hub = hub();
        let client = ClientId::new();
        let session = SessionId::new();
        let channel = topics::session_channel(&session);
        let mut sub = hub.join_channel(&channel, &client);

        for i in 0..100 {
            hub.publish("seq", json!({"i": i}), Some(&session));
        }

        for i in 0..100 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.data["i"], i);
            assert_eq!(event.version, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn versions_monotonic_per_channel() {
        let hub = hub();
        let session = SessionId::new();

        let v1 = hub.publish("a", json!({}), Some(&session));
        let v2 = hub.publish("b", json!({}), Some(&session));
        let v3 = hub.publish("c", json!({}), None); // different channel

        assert_eq!(v1, 1);
        assert_eq!(v2, 2);
        assert_eq!(v3, 1);
        assert_eq!(hub.channel_version(&topics::session_channel(&session)), 2);
        assert_eq!(hub.channel_version(topics::GLOBAL_CHANNEL), 1);
    }

    #[tokio::test]
    async fn leave_stops_delivery() {
        let hub = hub();
        let client = ClientId::new();
        let session = SessionId::new();
        let channel = topics::session_channel(&session);
        let mut sub = hub.join_channel(&channel, &client);

        hub.publish("one", json!({}), Some(&session));
        hub.leave_channel(&channel, &client);
        hub.publish("two", json!({}), Some(&session));

        assert_eq!(sub.recv().await.unwrap().topic, "one");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn disconnect_removes_all_subscriptions() {
        let hub = hub();
        let client = ClientId::new();
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        let mut sub1 = hub.join_channel(&topics::session_channel(&s1), &client);
        let mut sub2 = hub.join_channel(&topics::session_channel(&s2), &client);

        hub.disconnect(&client);
        hub.publish("x", json!({}), Some(&s1));
        hub.publish("x", json!({}), Some(&s2));

        assert!(sub1.recv().await.is_none());
        assert!(sub2.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_skipped() {
        let hub = hub();
        let gone = ClientId::new();
        let alive = ClientId::new();
        let session = SessionId::new();
        let channel = topics::session_channel(&session);

        let sub_gone = hub.join_channel(&channel, &gone);
        drop(sub_gone);
        let mut sub_alive = hub.join_channel(&channel, &alive);

        // Publisher never sees the dead subscriber
        hub.publish("still.works", json!({}), Some(&session));
        assert_eq!(sub_alive.recv().await.unwrap().topic, "still.works");
    }

    #[tokio::test]
    async fn rejoin_replaces_subscription() {
        let hub = hub();
        let client = ClientId::new();
        let session = SessionId::new();
        let channel = topics::session_channel(&session);

        let mut old = hub.join_channel(&channel, &client);
        let mut new = hub.join_channel(&channel, &client);

        hub.publish("after.rejoin", json!({}), Some(&session));
        assert!(old.recv().await.is_none());
        assert_eq!(new.recv().await.unwrap().topic, "after.rejoin");
    }

    #[tokio::test]
    async fn event_reaches_bus_and_global_channel() {
        let hub = hub();
        let mut bus = hub.subscribe_events();
        let client = ClientId::new();
        let mut global = hub.join_channel(topics::GLOBAL_CHANNEL, &client);

        hub.event("message.sendRequest", json!({"sessionId": "sess_1"}));

        let bus_event = bus.recv().await.unwrap();
        assert_eq!(bus_event.topic, "message.sendRequest");
        assert_eq!(bus_event.data["sessionId"], "sess_1");

        let channel_event = global.recv().await.unwrap();
        assert_eq!(channel_event.topic, "message.sendRequest");
    }

    #[tokio::test]
    async fn event_without_subscribers_does_not_panic() {
        let hub = hub();
        hub.event("nobody.listening", json!({}));
    }

    #[tokio::test]
    async fn snapshot_plus_version_gated_deltas_never_lose_or_duplicate() {
        // A client that applies deltas in version order, and after a
        // reconnect drops any delta at or below its snapshot's version,
        // ends up with every item exactly once.
        let hub = hub();
        let session = SessionId::new();
        let channel = topics::session_channel(&session);
        let client = ClientId::new();

        // Authoritative store the snapshot is derived from
        let mut store: Vec<i64> = Vec::new();
        let mut applied: Vec<i64> = Vec::new();

        let mut sub = hub.join_channel(&channel, &client);
        for i in 0..5 {
            store.push(i);
            hub.publish("delta", json!({"added": [i]}), Some(&session));
        }
        while let Some(event) = sub.try_recv() {
            applied.push(event.data["added"][0].as_i64().unwrap());
        }

        // Disconnect; messages keep flowing while the client is away
        hub.disconnect(&client);
        for i in 5..8 {
            store.push(i);
            hub.publish("delta", json!({"added": [i]}), Some(&session));
        }

        // Reconnect: re-join first, then read a snapshot (so deltas racing
        // the snapshot are also covered by the version gate)
        let mut sub = hub.join_channel(&channel, &client);
        for i in 8..10 {
            store.push(i);
            hub.publish("delta", json!({"added": [i]}), Some(&session));
        }
        let snapshot_version = hub.channel_version(&channel);
        let snapshot = store.clone();

        applied = snapshot;
        while let Some(event) = sub.try_recv() {
            if event.version <= snapshot_version {
                continue;
            }
            applied.push(event.data["added"][0].as_i64().unwrap());
        }

        assert_eq!(applied, store);
        let mut deduped = applied.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), store.len(), "no duplicates after reconnect");
    }

    #[tokio::test]
    async fn concurrent_publish_versions_unique() {
        let hub = hub();
        let session = SessionId::new();

        let mut handles = vec![];
        for _ in 0..10 {
            let hub = Arc::clone(&hub);
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                hub.publish("p", json!({}), Some(&session))
            }));
        }

        let mut versions = Vec::new();
        for h in handles {
            versions.push(h.await.unwrap());
        }
        versions.sort();
        versions.dedup();
        assert_eq!(versions.len(), 10);
    }
}
