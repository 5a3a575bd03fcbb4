//! Redis-backed store (feature `redis-store`).

use super::{
    KeyValueStore, PubSubStore, SortedSetCommand, SortedSetPipeline, SortedSetStore,
    StoreMessage, SubscriberConnection,
};
use super::resp::{Frame, RespCodec};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{ConnectionAddr, ConnectionInfo};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

/// Commands share one multiplexed connection; every subscriber connection
/// is a separate [`RedisSubscriber`] socket.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        tracing::info!(store = "redis", "connected to redis");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        let ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[async_trait]
impl SortedSetStore for RedisStore {
    async fn exec_sorted(&self, pipeline: &SortedSetPipeline) -> Result<Vec<i64>> {
        let key = pipeline.key();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in pipeline.commands() {
            match command {
                SortedSetCommand::RemoveRangeByScore { min, max } => {
                    pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg(*min).arg(*max);
                }
                SortedSetCommand::Count => {
                    pipe.cmd("ZCARD").arg(key);
                }
                SortedSetCommand::Add { score, member } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member.as_str());
                }
                SortedSetCommand::Expire { seconds } => {
                    pipe.cmd("EXPIRE").arg(key).arg(*seconds);
                }
            }
        }
        let mut conn = self.conn.clone();
        let replies: Vec<i64> = pipe.query_async(&mut conn).await?;
        Ok(replies)
    }
}

#[async_trait]
impl PubSubStore for RedisStore {
    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;
        Ok(receivers.max(0) as usize)
    }

    async fn connect_subscriber(&self) -> Result<Box<dyn SubscriberConnection>> {
        let subscriber = RedisSubscriber::connect(self.client.get_connection_info()).await?;
        Ok(Box::new(subscriber))
    }
}

type Reader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, RespCodec>;

/// A socket in subscriber mode.
///
/// Replies are read through one long-lived framed reader, so a cancelled
/// [`next_message`](SubscriberConnection::next_message) loses nothing. Messages
/// that arrive while waiting for a (un)subscribe confirmation are queued and
/// delivered first.
pub struct RedisSubscriber {
    frames: Reader,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    pending: VecDeque<StoreMessage>,
}

enum Push {
    Message(StoreMessage),
    Ack { kind: String, channel: String },
    Error(String),
    Other,
}

fn classify(frame: Frame) -> Push {
    let items = match frame {
        Frame::Error(e) => return Push::Error(e),
        Frame::Array(Some(items)) => items,
        _ => return Push::Other,
    };
    let kind = items.first().and_then(Frame::as_text).unwrap_or_default();
    let channel = items.get(1).and_then(Frame::as_text).map(str::to_string);
    match (kind, channel, items.get(2)) {
        ("message", Some(channel), Some(Frame::Bulk(Some(bytes)))) => {
            match String::from_utf8(bytes.clone()) {
                Ok(payload) => Push::Message(StoreMessage { channel, payload }),
                Err(_) => {
                    tracing::warn!(channel = %channel, "dropping non-text pub/sub payload");
                    Push::Other
                }
            }
        }
        (kind @ ("subscribe" | "unsubscribe"), Some(channel), _) => Push::Ack {
            kind: kind.to_string(),
            channel,
        },
        _ => Push::Other,
    }
}

fn connection_closed() -> Error {
    Error::store_with_context(
        "subscriber connection closed",
        ErrorContext::new().with_source("redis_subscriber"),
    )
}

impl RedisSubscriber {
    /// Open a subscriber socket and authenticate / select the database.
    pub async fn connect(info: &ConnectionInfo) -> Result<Self> {
        let (reader, writer): (Box<dyn AsyncRead + Send + Unpin>, Box<dyn AsyncWrite + Send + Unpin>) =
            match &info.addr {
                ConnectionAddr::Tcp(host, port) => {
                    let stream = TcpStream::connect((host.as_str(), *port)).await?;
                    stream.set_nodelay(true)?;
                    let (r, w) = stream.into_split();
                    (Box::new(r), Box::new(w))
                }
                #[cfg(unix)]
                ConnectionAddr::Unix(path) => {
                    let (r, w) = tokio::net::UnixStream::connect(path).await?.into_split();
                    (Box::new(r), Box::new(w))
                }
                other => {
                    return Err(Error::configuration_with_context(
                        format!("unsupported subscriber address {}", other),
                        ErrorContext::new().with_field_path("store.url"),
                    ))
                }
            };
        let mut subscriber = Self {
            frames: FramedRead::new(reader, RespCodec),
            writer,
            pending: VecDeque::new(),
        };

        if let Some(password) = &info.redis.password {
            let mut auth = redis::cmd("AUTH");
            if let Some(username) = &info.redis.username {
                auth.arg(username);
            }
            auth.arg(password);
            subscriber.request(&auth).await?;
        }
        if info.redis.db != 0 {
            let mut select = redis::cmd("SELECT");
            select.arg(info.redis.db);
            subscriber.request(&select).await?;
        }
        tracing::debug!(store = "redis", "subscriber connection opened");
        Ok(subscriber)
    }

    async fn send(&mut self, cmd: &redis::Cmd) -> Result<()> {
        self.writer.write_all(&cmd.get_packed_command()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        self.frames.next().await.unwrap_or_else(|| Err(connection_closed()))
    }

    /// Plain request/reply, only valid before the first SUBSCRIBE.
    async fn request(&mut self, cmd: &redis::Cmd) -> Result<()> {
        self.send(cmd).await?;
        match self.read_frame().await? {
            Frame::Error(e) => Err(Error::store_with_context(
                e,
                ErrorContext::new().with_source("redis_subscriber"),
            )),
            _ => Ok(()),
        }
    }

    /// Send `kind channel` and read until the server confirms it.
    async fn change_subscription(&mut self, kind: &str, channel: &str) -> Result<()> {
        let mut cmd = redis::cmd(&kind.to_ascii_uppercase());
        cmd.arg(channel);
        self.send(&cmd).await?;
        loop {
            match classify(self.read_frame().await?) {
                Push::Message(message) => self.pending.push_back(message),
                Push::Ack { kind: k, channel: c } if k == kind && c == channel => return Ok(()),
                Push::Error(e) => {
                    return Err(Error::store_with_context(
                        e,
                        ErrorContext::new()
                            .with_details(channel.to_string())
                            .with_source("redis_subscriber"),
                    ))
                }
                Push::Ack { .. } | Push::Other => {}
            }
        }
    }
}

#[async_trait]
impl SubscriberConnection for RedisSubscriber {
    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        self.change_subscription("subscribe", channel).await
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<()> {
        self.change_subscription("unsubscribe", channel).await
    }

    async fn next_message(&mut self) -> Option<StoreMessage> {
        if let Some(message) = self.pending.pop_front() {
            return Some(message);
        }
        loop {
            let frame = match self.frames.next().await? {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "subscriber connection failed");
                    return None;
                }
            };
            match classify(frame) {
                Push::Message(message) => return Some(message),
                Push::Error(e) => tracing::warn!(error = %e, "error reply on subscriber connection"),
                Push::Ack { .. } | Push::Other => {}
            }
        }
    }
}
