//! Redis messaging bus: durable ordered streams (XADD/XREAD) for the
//! pipeline queues and transient pub/sub for event fan-out.

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// One entry read from a Redis stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Async Redis wrapper with publish, subscribe, xadd, and xread helpers.
///
/// The connection manager reconnects transparently; consumers only see
/// transient errors, which their read loops log and retry.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    /// Connects to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { client, conn })
    }

    /// Returns a cloned connection for callers issuing their own commands
    /// (e.g. the alert throttle's sorted-set operations).
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Appends an entry to a stream with approximate MAXLEN trimming.
    pub async fn xadd(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        maxlen: usize,
    ) -> Result<String, BusError> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(stream, StreamMaxlen::Approx(maxlen), "*", fields)
            .await?;
        Ok(id)
    }

    /// Reads new entries after `last_id`, blocking up to `block_ms`.
    ///
    /// The bounded block keeps stop events responsive; an empty result
    /// simply means no new data arrived within the window.
    pub async fn xread(
        &self,
        stream: &str,
        last_id: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .count(count)
            .block(block_ms as usize);
        let reply: StreamReadReply = conn.xread_options(&[stream], &[last_id], &options).await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = HashMap::with_capacity(id.map.len());
                for (name, value) in id.map {
                    if let Ok(text) = redis::from_redis_value::<String>(&value) {
                        fields.insert(name, text);
                    }
                }
                entries.push(StreamEntry { id: id.id, fields });
            }
        }
        Ok(entries)
    }

    /// Publishes a payload on a pub/sub channel. Returns the receiver count.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BusError> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn.publish(channel, payload).await?;
        Ok(receivers)
    }

    /// Opens a dedicated pub/sub connection subscribed to `patterns`.
    pub async fn psubscribe(&self, patterns: &[&str]) -> Result<redis::aio::PubSub, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for pattern in patterns {
            pubsub.psubscribe(*pattern).await?;
        }
        Ok(pubsub)
    }

    /// Opens a dedicated pub/sub connection subscribed to exact `channels`.
    pub async fn subscribe(&self, channels: &[&str]) -> Result<redis::aio::PubSub, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(*channel).await?;
        }
        Ok(pubsub)
    }

    /// Atomic "set if absent with TTL". Returns `true` when the key was
    /// newly created, `false` when it already existed.
    pub async fn set_nx_ex(&self, key: &str, ttl_s: u64) -> Result<bool, BusError> {
        let mut conn = self.conn.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_s)
            .query_async(&mut conn)
            .await?;
        Ok(outcome.is_some())
    }

    /// Connectivity probe.
    pub async fn health_check(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }
}
