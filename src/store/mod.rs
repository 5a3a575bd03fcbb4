//! 存储抽象：键值、有序集合与发布/订阅的最小命令面。
//!
//! # Backing Store
//!
//! The resilience layer only ever talks to its shared store through a narrow
//! command surface. This module defines that surface as three traits so the
//! same limiter, cache and event bus code runs against an in-process
//! [`MemoryStore`] or, with the `redis-store` feature, a Redis server.
//!
//! | Trait | Commands |
//! |-------|----------|
//! | [`KeyValueStore`] | `get`, `set` (with optional TTL), `del`, `ttl` |
//! | [`SortedSetStore`] | atomic `zremrangebyscore` / `zcard` / `zadd` / `expire` pipelines |
//! | [`PubSubStore`] | `publish`, dedicated subscriber connections |

mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;
#[cfg(feature = "redis-store")]
mod resp;

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use redis_store::{RedisStore, RedisSubscriber};

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Store `value`, replacing any previous value. `None` keeps it forever.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Returns whether a key was removed.
    async fn del(&self, key: &str) -> Result<bool>;
    /// Remaining time to live; `None` for missing keys and keys without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
    fn name(&self) -> &'static str;
}

/// One command of a sorted-set pipeline. Scores are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortedSetCommand {
    RemoveRangeByScore { min: u64, max: u64 },
    Count,
    Add { score: u64, member: String },
    Expire { seconds: u64 },
}

/// Commands against a single sorted-set key, executed as one atomic unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedSetPipeline {
    key: String,
    commands: Vec<SortedSetCommand>,
}

impl SortedSetPipeline {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            commands: Vec::new(),
        }
    }

    pub fn zremrangebyscore(mut self, min: u64, max: u64) -> Self {
        self.commands
            .push(SortedSetCommand::RemoveRangeByScore { min, max });
        self
    }

    pub fn zcard(mut self) -> Self {
        self.commands.push(SortedSetCommand::Count);
        self
    }

    pub fn zadd(mut self, score: u64, member: impl Into<String>) -> Self {
        self.commands.push(SortedSetCommand::Add {
            score,
            member: member.into(),
        });
        self
    }

    pub fn expire(mut self, seconds: u64) -> Self {
        self.commands.push(SortedSetCommand::Expire { seconds });
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn commands(&self) -> &[SortedSetCommand] {
        &self.commands
    }
}

#[async_trait]
pub trait SortedSetStore: KeyValueStore {
    /// Execute every command atomically; one integer reply per command, in order.
    async fn exec_sorted(&self, pipeline: &SortedSetPipeline) -> Result<Vec<i64>>;
}

/// A message delivered on a subscriber connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

#[async_trait]
pub trait PubSubStore: Send + Sync {
    /// Returns the number of connections that received the message.
    async fn publish(&self, channel: &str, message: &str) -> Result<usize>;
    /// Open a dedicated connection for receiving messages.
    async fn connect_subscriber(&self) -> Result<Box<dyn SubscriberConnection>>;
}

/// A connection in subscriber mode. Dropping it releases the connection.
#[async_trait]
pub trait SubscriberConnection: Send {
    async fn subscribe(&mut self, channel: &str) -> Result<()>;
    async fn unsubscribe(&mut self, channel: &str) -> Result<()>;
    /// Next message on any subscribed channel; `None` once the connection is gone.
    /// Must be cancel-safe: dropping the future loses no message.
    async fn next_message(&mut self) -> Option<StoreMessage>;
}
