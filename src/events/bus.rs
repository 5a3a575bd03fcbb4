//! Event bus over a pub/sub store.
//!
//! Publishing goes straight to the store. Receiving goes through one shared
//! subscriber connection per bus, opened on the first subscription and owned
//! by a pump task. The pump keeps a local routing table (slot arena indexed by
//! channel) and issues a store-level SUBSCRIBE only for the first local
//! subscriber of a channel, and UNSUBSCRIBE once the last one has left.

use super::EventPayload;
use crate::store::{PubSubStore, StoreMessage, SubscriberConnection};
use crate::utils::clock::{system_clock, Clock};
use crate::{Error, ErrorContext, Result};
use futures::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Callback invoked on the pump task for every payload on a subscribed channel.
/// It must not block.
pub type EventCallback = Arc<dyn Fn(EventPayload) + Send + Sync>;

/// Handle into the routing table. Stale ids never match a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    index: usize,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusStats {
    /// Local subscriptions across all channels.
    pub subscriptions: usize,
    /// Channels subscribed on the store connection.
    pub channels: usize,
}

enum Sink {
    Callback(EventCallback),
    Stream(mpsc::Sender<EventPayload>),
}

struct Route {
    channel: String,
    sink: Sink,
}

#[derive(Default)]
struct RoutingTable {
    slots: Vec<Option<Route>>,
    generations: Vec<u64>,
    free: Vec<usize>,
    by_channel: HashMap<String, Vec<usize>>,
}

impl RoutingTable {
    /// Returns the new id and whether it is the first route on `channel`.
    fn insert(&mut self, channel: String, sink: Sink) -> (SubscriptionId, bool) {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(None);
                self.generations.push(0);
                self.slots.len() - 1
            }
        };
        let indices = self.by_channel.entry(channel.clone()).or_default();
        let first = indices.is_empty();
        indices.push(index);
        self.slots[index] = Some(Route { channel, sink });
        let id = SubscriptionId {
            index,
            generation: self.generations[index],
        };
        (id, first)
    }

    /// Returns the route's channel and whether it was the last route on it.
    fn remove(&mut self, id: SubscriptionId) -> Option<(String, bool)> {
        if self.generations.get(id.index) != Some(&id.generation) {
            return None;
        }
        let route = self.slots.get_mut(id.index)?.take()?;
        self.generations[id.index] += 1;
        self.free.push(id.index);

        let mut last = false;
        if let Some(indices) = self.by_channel.get_mut(&route.channel) {
            indices.retain(|&i| i != id.index);
            if indices.is_empty() {
                self.by_channel.remove(&route.channel);
                last = true;
            }
        }
        Some((route.channel, last))
    }

    fn dispatch(&self, message: StoreMessage) {
        let Some(indices) = self.by_channel.get(&message.channel) else {
            return;
        };
        let payload = match EventPayload::from_json(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(channel = %message.channel, error = %e, "dropping unparseable event");
                return;
            }
        };
        for &index in indices {
            let Some(route) = self.slots[index].as_ref() else {
                continue;
            };
            match &route.sink {
                Sink::Callback(callback) => {
                    let delivered = catch_unwind(AssertUnwindSafe(|| callback(payload.clone())));
                    if delivered.is_err() {
                        tracing::error!(channel = %route.channel, event = %payload.event, "event callback panicked");
                    }
                }
                Sink::Stream(tx) => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(payload.clone()) {
                        tracing::warn!(channel = %route.channel, event = %payload.event, "subscriber lagging, event dropped");
                    }
                }
            }
        }
    }

    fn channels(&self) -> Vec<String> {
        self.by_channel.keys().cloned().collect()
    }

    fn stats(&self) -> BusStats {
        BusStats {
            subscriptions: self.slots.iter().filter(|s| s.is_some()).count(),
            channels: self.by_channel.len(),
        }
    }
}

enum Command {
    Subscribe {
        channel: String,
        sink: Sink,
        ack: oneshot::Sender<Result<SubscriptionId>>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Stats {
        ack: oneshot::Sender<BusStats>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

async fn pump(mut conn: Box<dyn SubscriberConnection>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut table = RoutingTable::default();
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(Command::Subscribe { channel, sink, ack }) => {
                    let (id, first) = table.insert(channel.clone(), sink);
                    if first {
                        if let Err(e) = conn.subscribe(&channel).await {
                            tracing::warn!(channel = %channel, error = %e, "store subscribe failed");
                            table.remove(id);
                            let _ = ack.send(Err(e));
                            continue;
                        }
                        tracing::debug!(channel = %channel, "subscribed on shared connection");
                    }
                    let _ = ack.send(Ok(id));
                }
                Some(Command::Unsubscribe { id }) => {
                    if let Some((channel, true)) = table.remove(id) {
                        match conn.unsubscribe(&channel).await {
                            Ok(()) => tracing::debug!(channel = %channel, "last local subscriber left"),
                            Err(e) => tracing::warn!(channel = %channel, error = %e, "store unsubscribe failed"),
                        }
                    }
                }
                Some(Command::Stats { ack }) => {
                    let _ = ack.send(table.stats());
                }
                Some(Command::Shutdown { ack }) => {
                    for channel in table.channels() {
                        if let Err(e) = conn.unsubscribe(&channel).await {
                            tracing::warn!(channel = %channel, error = %e, "store unsubscribe failed");
                        }
                    }
                    let _ = ack.send(());
                    break;
                }
                None => break,
            },
            message = conn.next_message() => match message {
                Some(message) => table.dispatch(message),
                None => {
                    tracing::warn!("subscriber connection closed");
                    break;
                }
            },
        }
    }
}

struct PumpHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

struct BusInner {
    store: Arc<dyn PubSubStore>,
    clock: Arc<dyn Clock>,
    pump: Mutex<Option<PumpHandle>>,
    stream_capacity: usize,
}

/// Publishes envelopes and fans incoming ones out to local subscribers.
///
/// Cloning is cheap and shares the subscriber connection.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub const DEFAULT_STREAM_CAPACITY: usize = 256;

    pub fn new(store: Arc<dyn PubSubStore>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                store,
                clock: system_clock(),
                pump: Mutex::new(None),
                stream_capacity: Self::DEFAULT_STREAM_CAPACITY,
            }),
        }
    }

    /// Builder-style setter; only meaningful before the bus is cloned.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        let inner = &self.inner;
        Self {
            inner: Arc::new(BusInner {
                store: Arc::clone(&inner.store),
                clock,
                pump: Mutex::new(None),
                stream_capacity: inner.stream_capacity,
            }),
        }
    }

    /// Buffer size of [`EventStream`]s; events beyond it are dropped.
    pub fn with_stream_capacity(self, capacity: usize) -> Self {
        let inner = &self.inner;
        Self {
            inner: Arc::new(BusInner {
                store: Arc::clone(&inner.store),
                clock: Arc::clone(&inner.clock),
                pump: Mutex::new(None),
                stream_capacity: capacity.max(1),
            }),
        }
    }

    /// Publish `{event, data, timestamp}` on `channel`.
    ///
    /// Never fails; problems are logged. Returns the number of subscriber
    /// connections that received it, `0` when publishing failed.
    pub async fn publish<T>(&self, channel: &str, event: &str, data: &T) -> usize
    where
        T: Serialize + ?Sized,
    {
        self.publish_all(&[channel], event, data).await
    }

    /// Publish one envelope on every channel in `channels`.
    ///
    /// The envelope is serialized once, so every channel carries the same
    /// bytes and timestamp. Returns the receiver count summed over channels.
    pub async fn publish_all<T>(&self, channels: &[&str], event: &str, data: &T) -> usize
    where
        T: Serialize + ?Sized,
    {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(?channels, event, error = %e, "event data is not serializable");
                return 0;
            }
        };
        let payload = EventPayload::new(event, data, self.inner.clock.now_ms());
        let raw = match payload.to_json() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(?channels, event, error = %e, "event envelope is not serializable");
                return 0;
            }
        };
        let mut total = 0;
        for &channel in channels {
            match self.inner.store.publish(channel, &raw).await {
                Ok(receivers) => {
                    tracing::debug!(channel, event, receivers, "event published");
                    total += receivers;
                }
                Err(e) => {
                    tracing::error!(channel, event, error = %e, "event publish failed");
                }
            }
        }
        total
    }

    /// Command sender for the running pump, starting one if needed.
    async fn commands(&self) -> Result<mpsc::UnboundedSender<Command>> {
        let mut slot = self.inner.pump.lock().await;
        if let Some(handle) = slot.as_ref() {
            if !handle.commands.is_closed() {
                return Ok(handle.commands.clone());
            }
            tracing::info!("subscriber pump stopped, reconnecting");
        }
        let conn = self.inner.store.connect_subscriber().await.map_err(|e| {
            tracing::error!(error = %e, "could not open subscriber connection");
            e
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(conn, rx));
        *slot = Some(PumpHandle {
            commands: tx.clone(),
            task,
        });
        Ok(tx)
    }

    async fn register(&self, channel: &str, sink: Sink) -> Result<Subscription> {
        let commands = self.commands().await?;
        let (ack, done) = oneshot::channel();
        commands
            .send(Command::Subscribe {
                channel: channel.to_string(),
                sink,
                ack,
            })
            .map_err(|_| pump_gone(channel))?;
        let id = done.await.map_err(|_| pump_gone(channel))??;
        Ok(Subscription {
            id,
            channel: channel.to_string(),
            commands,
            active: AtomicBool::new(true),
        })
    }

    /// Invoke `callback` for every payload published on `channel`.
    ///
    /// The callback runs on the bus's pump task and must return quickly.
    /// Dropping or unsubscribing the returned handle stops delivery.
    pub async fn subscribe<F>(&self, channel: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(EventPayload) + Send + Sync + 'static,
    {
        self.register(channel, Sink::Callback(Arc::new(callback)))
            .await
    }

    /// Receive payloads for `channel` as a stream.
    pub async fn subscribe_stream(&self, channel: &str) -> Result<EventStream> {
        let (tx, rx) = mpsc::channel(self.inner.stream_capacity);
        let subscription = self.register(channel, Sink::Stream(tx)).await?;
        Ok(EventStream { rx, subscription })
    }

    pub async fn stats(&self) -> BusStats {
        let sender = {
            let pump = self.inner.pump.lock().await;
            match pump.as_ref() {
                Some(handle) => handle.commands.clone(),
                None => return BusStats::default(),
            }
        };
        let (ack, done) = oneshot::channel();
        if sender.send(Command::Stats { ack }).is_err() {
            return BusStats::default();
        }
        done.await.unwrap_or_default()
    }

    /// Unsubscribe everything and close the subscriber connection.
    ///
    /// Outstanding [`Subscription`]s become inert. A later subscribe opens a
    /// new connection.
    pub async fn cleanup(&self) {
        let Some(handle) = self.inner.pump.lock().await.take() else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if handle.commands.send(Command::Shutdown { ack }).is_ok() {
            let _ = done.await;
        }
        if let Err(e) = handle.task.await {
            tracing::warn!(error = %e, "subscriber pump ended abnormally");
        }
        tracing::info!("event bus cleaned up");
    }
}

fn pump_gone(channel: &str) -> Error {
    Error::runtime_with_context(
        "subscriber pump is not running",
        ErrorContext::new()
            .with_details(channel.to_string())
            .with_source("event_bus"),
    )
}

/// A live registration on the bus. Unsubscribes when dropped.
pub struct Subscription {
    id: SubscriptionId,
    channel: String,
    commands: mpsc::UnboundedSender<Command>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            // A closed pump already dropped every route.
            let _ = self.commands.send(Command::Unsubscribe { id: self.id });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Payloads of one channel, in publish order. Ends after `cleanup`.
pub struct EventStream {
    rx: mpsc::Receiver<EventPayload>,
    subscription: Subscription,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<EventPayload> {
        self.rx.recv().await
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn channel(&self) -> &str {
        self.subscription.channel()
    }
}

impl Stream for EventStream {
    type Item = EventPayload;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    async fn next(rx: &mut mpsc::UnboundedReceiver<EventPayload>) -> Option<EventPayload> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn test_routing_table_reuses_slots_with_new_generation() {
        let mut table = RoutingTable::default();
        let (tx, _rx) = mpsc::channel(1);
        let (a, first) = table.insert("c".into(), Sink::Stream(tx.clone()));
        assert!(first);
        let (b, first) = table.insert("c".into(), Sink::Stream(tx.clone()));
        assert!(!first);

        assert_eq!(table.remove(a), Some(("c".to_string(), false)));
        assert_eq!(table.remove(a), None);
        let (c, first) = table.insert("d".into(), Sink::Stream(tx));
        assert!(first);
        assert_eq!(c.index, a.index);
        assert_ne!(c.generation, a.generation);
        // the stale id must not remove the new occupant
        assert_eq!(table.remove(a), None);
        assert_eq!(table.remove(b), Some(("c".to_string(), true)));
        assert_eq!(table.stats(), BusStats { subscriptions: 1, channels: 1 });
    }

    #[tokio::test]
    async fn test_round_trip_and_unsubscribe() {
        let store = MemoryStore::new();
        let bus = EventBus::new(Arc::new(store.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = bus
            .subscribe("C", move |payload| {
                let _ = tx.send(payload);
            })
            .await
            .unwrap();

        assert_eq!(bus.publish("C", "x", &json!({"a": 1})).await, 1);
        let got = next(&mut rx).await.unwrap();
        assert_eq!(got.event, "x");
        assert_eq!(got.data["a"], 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.stats().await, BusStats::default());
        assert_eq!(store.subscriber_count("C"), 0);
        bus.publish("C", "x", &json!({"a": 2})).await;
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_one_store_subscription_per_channel() {
        let store = MemoryStore::new();
        let bus = EventBus::new(Arc::new(store.clone()));
        let a = bus.subscribe_stream("org:events:o1").await.unwrap();
        let mut b = bus.subscribe_stream("org:events:o1").await.unwrap();
        let _other = bus.subscribe_stream("global:events").await.unwrap();
        assert_eq!(store.subscriber_count("org:events:o1"), 1);
        assert_eq!(bus.stats().await, BusStats { subscriptions: 3, channels: 2 });

        drop(a);
        assert_eq!(bus.stats().await.subscriptions, 2);
        assert_eq!(store.subscriber_count("org:events:o1"), 1);

        bus.publish("org:events:o1", "session.updated", &json!({})).await;
        assert_eq!(b.recv().await.unwrap().event, "session.updated");
    }

    #[tokio::test]
    async fn test_per_channel_order_is_preserved() {
        let bus = EventBus::new(Arc::new(MemoryStore::new()));
        let mut stream = bus.subscribe_stream("session:events:s1").await.unwrap();
        for i in 0..20 {
            bus.publish("session:events:s1", "message.received", &json!({ "n": i }))
                .await;
        }
        for i in 0..20 {
            assert_eq!(stream.recv().await.unwrap().data["n"], i);
        }
    }

    #[tokio::test]
    async fn test_garbage_and_panics_do_not_kill_the_pump() {
        let store = MemoryStore::new();
        let bus = EventBus::new(Arc::new(store.clone()));
        let _boom = bus
            .subscribe("c", |_| panic!("handler bug"))
            .await
            .unwrap();
        let mut stream = bus.subscribe_stream("c").await.unwrap();

        store.publish("c", "not json").await.unwrap();
        bus.publish("c", "ok", &json!(null)).await;
        assert_eq!(stream.recv().await.unwrap().event, "ok");
    }

    #[tokio::test]
    async fn test_cleanup_closes_connection_and_allows_resubscribe() {
        let store = MemoryStore::new();
        let bus = EventBus::new(Arc::new(store.clone()));
        let mut stream = bus.subscribe_stream("c").await.unwrap();
        bus.cleanup().await;
        assert_eq!(store.subscriber_count("c"), 0);
        assert!(stream.recv().await.is_none());
        assert_eq!(bus.stats().await, BusStats::default());

        let mut again = bus.subscribe_stream("c").await.unwrap();
        bus.publish("c", "back", &json!({})).await;
        assert_eq!(again.recv().await.unwrap().event, "back");
        drop(stream);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_reports_zero() {
        let bus = EventBus::new(Arc::new(MemoryStore::new()));
        assert_eq!(bus.publish("global:events", "noop", &json!({})).await, 0);
    }
}
