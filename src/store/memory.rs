//! In-process store implementing the key-value, sorted-set and pub/sub surfaces.

use super::{
    KeyValueStore, PubSubStore, SortedSetCommand, SortedSetPipeline, SortedSetStore,
    StoreMessage, SubscriberConnection,
};
use crate::utils::clock::{system_clock, Clock};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Interval of the background sweeper when none is given.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
enum Value {
    Str(String),
    Sorted(BTreeSet<(u64, String)>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

type Subscribers = Vec<(u64, mpsc::UnboundedSender<StoreMessage>)>;

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, Subscribers>,
}

impl Inner {
    /// Live entry for `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str, now: u64) -> Option<&mut Entry> {
        if self
            .entries
            .get(key)
            .map(|e| e.is_expired(now))
            .unwrap_or(false)
        {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

fn wrong_type(key: &str) -> Error {
    Error::store_with_context(
        "WRONGTYPE operation against a key holding the wrong kind of value",
        ErrorContext::new()
            .with_details(key.to_string())
            .with_source("memory_store"),
    )
}

/// Single-process store. Cloning shares the underlying data.
///
/// TTLs follow the injected [`Clock`]; expired entries are invisible on access
/// and are physically removed by [`MemoryStore::purge_expired`] or the sweeper.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
    next_connection: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired(now));
        before - inner.entries.len()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.lock()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically purge expired entries until the handle is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = store.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "memory store swept expired entries");
                }
            }
        })
    }

    /// Number of subscriber connections currently registered on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock()
            .channels
            .get(channel)
            .map(|subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        match inner.live(key, now) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.now_ms();
        let expires_at = ttl.map(|t| now + t.as_millis() as u64);
        self.lock().entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        let live = inner.live(key, now).is_some();
        inner.entries.remove(key);
        Ok(live)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        Ok(inner
            .live(key, now)
            .and_then(|e| e.expires_at)
            .map(|at| Duration::from_millis(at.saturating_sub(now))))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl SortedSetStore for MemoryStore {
    async fn exec_sorted(&self, pipeline: &SortedSetPipeline) -> Result<Vec<i64>> {
        let now = self.clock.now_ms();
        let key = pipeline.key();
        let mut inner = self.lock();
        if let Some(Entry {
            value: Value::Str(_),
            ..
        }) = inner.live(key, now)
        {
            return Err(wrong_type(key));
        }

        let mut replies = Vec::with_capacity(pipeline.commands().len());
        for command in pipeline.commands() {
            let reply = match command {
                SortedSetCommand::RemoveRangeByScore { min, max } => {
                    match inner.live(key, now) {
                        Some(Entry {
                            value: Value::Sorted(set),
                            ..
                        }) => {
                            let before = set.len();
                            set.retain(|(score, _)| score < min || score > max);
                            (before - set.len()) as i64
                        }
                        _ => 0,
                    }
                }
                SortedSetCommand::Count => match inner.live(key, now) {
                    Some(Entry {
                        value: Value::Sorted(set),
                        ..
                    }) => set.len() as i64,
                    _ => 0,
                },
                SortedSetCommand::Add { score, member } => {
                    let entry = inner.entries.entry(key.to_string()).or_insert(Entry {
                        value: Value::Sorted(BTreeSet::new()),
                        expires_at: None,
                    });
                    match &mut entry.value {
                        Value::Sorted(set) => {
                            let existed = set.iter().find(|(_, m)| m == member).cloned();
                            if let Some(old) = &existed {
                                set.remove(old);
                            }
                            set.insert((*score, member.clone()));
                            if existed.is_some() {
                                0
                            } else {
                                1
                            }
                        }
                        Value::Str(_) => return Err(wrong_type(key)),
                    }
                }
                SortedSetCommand::Expire { seconds } => match inner.live(key, now) {
                    Some(entry) => {
                        entry.expires_at = Some(now + seconds * 1000);
                        1
                    }
                    None => 0,
                },
            };
            replies.push(reply);
        }

        // Redis drops sorted sets that become empty.
        let emptied = matches!(
            inner.entries.get(key),
            Some(Entry { value: Value::Sorted(set), .. }) if set.is_empty()
        );
        if emptied {
            inner.entries.remove(key);
        }
        Ok(replies)
    }
}

#[async_trait]
impl PubSubStore for MemoryStore {
    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let mut inner = self.lock();
        let Some(subscribers) = inner.channels.get_mut(channel) else {
            return Ok(0);
        };
        subscribers.retain(|(_, tx)| !tx.is_closed());
        let mut delivered = 0;
        for (_, tx) in subscribers.iter() {
            let msg = StoreMessage {
                channel: channel.to_string(),
                payload: message.to_string(),
            };
            if tx.send(msg).is_ok() {
                delivered += 1;
            }
        }
        if subscribers.is_empty() {
            inner.channels.remove(channel);
        }
        Ok(delivered)
    }

    async fn connect_subscriber(&self) -> Result<Box<dyn SubscriberConnection>> {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(MemorySubscriber {
            id,
            store: self.clone(),
            tx,
            rx,
            channels: HashSet::new(),
        }))
    }
}

struct MemorySubscriber {
    id: u64,
    store: MemoryStore,
    tx: mpsc::UnboundedSender<StoreMessage>,
    rx: mpsc::UnboundedReceiver<StoreMessage>,
    channels: HashSet<String>,
}

impl MemorySubscriber {
    fn detach(&self, inner: &mut Inner, channel: &str) {
        if let Some(subs) = inner.channels.get_mut(channel) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                inner.channels.remove(channel);
            }
        }
    }
}

#[async_trait]
impl SubscriberConnection for MemorySubscriber {
    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        if self.channels.insert(channel.to_string()) {
            self.store
                .lock()
                .channels
                .entry(channel.to_string())
                .or_default()
                .push((self.id, self.tx.clone()));
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<()> {
        if self.channels.remove(channel) {
            let mut inner = self.store.lock();
            self.detach(&mut inner, channel);
        }
        Ok(())
    }

    async fn next_message(&mut self) -> Option<StoreMessage> {
        self.rx.recv().await
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        let mut inner = self.store.lock();
        for channel in &self.channels {
            self.detach(&mut inner, channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;

    fn store_at(start: u64) -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_set_get_with_ttl_expiry() {
        let (store, clock) = store_at(10_000);
        store
            .set("contact:phone:123", "{}", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(store.get("contact:phone:123").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(
            store.ttl("contact:phone:123").await.unwrap(),
            Some(Duration::from_secs(5))
        );

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("contact:phone:123").await.unwrap(), None);
        assert_eq!(store.ttl("contact:phone:123").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_del_reports_removal() {
        let (store, _) = store_at(0);
        store.set("k", "v", None).await.unwrap();
        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
        assert_eq!(store.ttl("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_expired_drops_only_expired() {
        let (store, clock) = store_at(0);
        store.set("a", "1", Some(Duration::from_millis(10))).await.unwrap();
        store.set("b", "2", None).await.unwrap();
        clock.advance(Duration::from_millis(20));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sorted_pipeline_replies() {
        let (store, _) = store_at(1_000);
        let first = SortedSetPipeline::new("z")
            .zremrangebyscore(0, 500)
            .zcard()
            .zadd(1_000, "a")
            .expire(60);
        assert_eq!(store.exec_sorted(&first).await.unwrap(), vec![0, 0, 1, 1]);

        let second = SortedSetPipeline::new("z")
            .zadd(1_100, "b")
            .zadd(1_200, "a")
            .zcard();
        assert_eq!(store.exec_sorted(&second).await.unwrap(), vec![1, 0, 2]);

        let trim = SortedSetPipeline::new("z").zremrangebyscore(0, 1_150).zcard();
        assert_eq!(store.exec_sorted(&trim).await.unwrap(), vec![1, 1]);
        assert_eq!(store.ttl("z").await.unwrap(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_sorted_ops_reject_string_keys() {
        let (store, _) = store_at(0);
        store.set("plain", "x", None).await.unwrap();
        let err = store
            .exec_sorted(&SortedSetPipeline::new("plain").zcard())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store { .. }));

        store
            .exec_sorted(&SortedSetPipeline::new("zs").zadd(1, "m"))
            .await
            .unwrap();
        assert!(store.get("zs").await.is_err());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribed_connections_only() {
        let store = MemoryStore::new();
        let mut a = store.connect_subscriber().await.unwrap();
        let mut b = store.connect_subscriber().await.unwrap();
        a.subscribe("org:events:o1").await.unwrap();
        b.subscribe("global:events").await.unwrap();

        assert_eq!(store.publish("org:events:o1", "hello").await.unwrap(), 1);
        let msg = a.next_message().await.unwrap();
        assert_eq!(msg.channel, "org:events:o1");
        assert_eq!(msg.payload, "hello");

        a.unsubscribe("org:events:o1").await.unwrap();
        assert_eq!(store.publish("org:events:o1", "again").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropping_connection_releases_registrations() {
        let store = MemoryStore::new();
        let mut conn = store.connect_subscriber().await.unwrap();
        conn.subscribe("c").await.unwrap();
        conn.subscribe("c").await.unwrap();
        assert_eq!(store.subscriber_count("c"), 1);
        drop(conn);
        assert_eq!(store.subscriber_count("c"), 0);
    }
}
