//! Alert suppression: dedup keys with TTL and a per-stream sliding-window
//! rate limit.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use voxsentinel_common::RedisBus;

pub const DEFAULT_DEDUP_TTL_S: u64 = 10;
pub const DEFAULT_MAX_PER_MINUTE: usize = 30;

/// Throttle window length and the safety TTL on the backing key.
const WINDOW_MS: i64 = 60_000;
const RECORD_TTL_S: i64 = 120;

/// Storage backend for suppression state. The Redis implementation is the
/// production path; the in-memory one serves single-process deployments
/// and tests.
#[async_trait]
pub trait SuppressionStore: Send + Sync {
    /// Atomic "seen within TTL" check for `(stream, rule, match_type)`.
    async fn is_duplicate(
        &self,
        stream_id: Uuid,
        rule: &str,
        match_type: &str,
    ) -> anyhow::Result<bool>;

    /// Whether the stream has reached its per-minute dispatch budget.
    async fn is_throttled(&self, stream_id: Uuid) -> anyhow::Result<bool>;

    /// Records one dispatched alert at the current time.
    async fn record(&self, stream_id: Uuid) -> anyhow::Result<()>;
}

fn dedup_key(stream_id: Uuid, rule: &str, match_type: &str) -> String {
    format!("dedup:{stream_id}:{rule}:{match_type}")
}

fn throttle_key(stream_id: Uuid) -> String {
    format!("throttle:{stream_id}")
}

/// Redis-backed suppression: `SET NX EX` dedup keys plus a sorted set of
/// dispatch timestamps per stream.
pub struct RedisSuppression {
    bus: RedisBus,
    dedup_ttl_s: u64,
    max_per_minute: usize,
}

impl RedisSuppression {
    pub fn new(bus: RedisBus, dedup_ttl_s: u64, max_per_minute: usize) -> Self {
        Self {
            bus,
            dedup_ttl_s,
            max_per_minute,
        }
    }
}

#[async_trait]
impl SuppressionStore for RedisSuppression {
    async fn is_duplicate(
        &self,
        stream_id: Uuid,
        rule: &str,
        match_type: &str,
    ) -> anyhow::Result<bool> {
        let key = dedup_key(stream_id, rule, match_type);
        let created = self.bus.set_nx_ex(&key, self.dedup_ttl_s).await?;
        Ok(!created)
    }

    async fn is_throttled(&self, stream_id: Uuid) -> anyhow::Result<bool> {
        let key = throttle_key(stream_id);
        let now_ms = Utc::now().timestamp_millis();
        let cutoff = now_ms - WINDOW_MS;

        let mut conn = self.bus.connection();
        let (count,): (usize,) = redis::pipe()
            .atomic()
            .zrembyscore(&key, "-inf", cutoff)
            .ignore()
            .zcard(&key)
            .query_async(&mut conn)
            .await?;
        Ok(count >= self.max_per_minute)
    }

    async fn record(&self, stream_id: Uuid) -> anyhow::Result<()> {
        let key = throttle_key(stream_id);
        let now_ms = Utc::now().timestamp_millis();
        let member = format!("{now_ms}:{}", Uuid::new_v4());

        let mut conn = self.bus.connection();
        let _: () = redis::pipe()
            .atomic()
            .zadd(&key, member, now_ms)
            .ignore()
            .expire(&key, RECORD_TTL_S)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Process-local suppression with the same semantics.
pub struct MemorySuppression {
    dedup_ttl: Duration,
    max_per_minute: usize,
    dedup: Mutex<HashMap<String, Instant>>,
    dispatched: Mutex<HashMap<Uuid, Vec<Instant>>>,
}

impl MemorySuppression {
    pub fn new(dedup_ttl_s: u64, max_per_minute: usize) -> Self {
        Self {
            dedup_ttl: Duration::from_secs(dedup_ttl_s),
            max_per_minute,
            dedup: Mutex::new(HashMap::new()),
            dispatched: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SuppressionStore for MemorySuppression {
    async fn is_duplicate(
        &self,
        stream_id: Uuid,
        rule: &str,
        match_type: &str,
    ) -> anyhow::Result<bool> {
        let key = dedup_key(stream_id, rule, match_type);
        let now = Instant::now();
        let mut dedup = self.dedup.lock();
        dedup.retain(|_, seen| now.duration_since(*seen) < self.dedup_ttl);
        if dedup.contains_key(&key) {
            return Ok(true);
        }
        dedup.insert(key, now);
        Ok(false)
    }

    async fn is_throttled(&self, stream_id: Uuid) -> anyhow::Result<bool> {
        let now = Instant::now();
        let mut dispatched = self.dispatched.lock();
        let entries = dispatched.entry(stream_id).or_default();
        entries.retain(|t| now.duration_since(*t) < Duration::from_millis(WINDOW_MS as u64));
        Ok(entries.len() >= self.max_per_minute)
    }

    async fn record(&self, stream_id: Uuid) -> anyhow::Result<()> {
        self.dispatched
            .lock()
            .entry(stream_id)
            .or_default()
            .push(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Uuid {
        Uuid::new_v4()
    }

    #[tokio::test]
    async fn first_occurrence_is_not_duplicate() {
        let store = MemorySuppression::new(10, 30);
        assert!(!store.is_duplicate(stream(), "gun", "exact").await.unwrap());
    }

    #[tokio::test]
    async fn repeat_within_ttl_is_duplicate() {
        let store = MemorySuppression::new(10, 30);
        let sid = stream();
        assert!(!store.is_duplicate(sid, "gun", "exact").await.unwrap());
        assert!(store.is_duplicate(sid, "gun", "exact").await.unwrap());
    }

    #[tokio::test]
    async fn different_keywords_are_independent() {
        let store = MemorySuppression::new(10, 30);
        let sid = stream();
        assert!(!store.is_duplicate(sid, "gun", "exact").await.unwrap());
        assert!(!store.is_duplicate(sid, "bomb", "exact").await.unwrap());
    }

    #[tokio::test]
    async fn different_match_types_are_independent() {
        let store = MemorySuppression::new(10, 30);
        let sid = stream();
        assert!(!store.is_duplicate(sid, "gun", "exact").await.unwrap());
        assert!(!store.is_duplicate(sid, "gun", "fuzzy").await.unwrap());
    }

    #[tokio::test]
    async fn dedup_expires_after_ttl() {
        let store = MemorySuppression::new(0, 30);
        let sid = stream();
        assert!(!store.is_duplicate(sid, "gun", "exact").await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!store.is_duplicate(sid, "gun", "exact").await.unwrap());
    }

    #[tokio::test]
    async fn throttle_opens_at_limit() {
        let store = MemorySuppression::new(10, 3);
        let sid = stream();
        for _ in 0..3 {
            assert!(!store.is_throttled(sid).await.unwrap());
            store.record(sid).await.unwrap();
        }
        assert!(store.is_throttled(sid).await.unwrap());
    }

    #[tokio::test]
    async fn throttle_is_per_stream() {
        let store = MemorySuppression::new(10, 1);
        let a = stream();
        let b = stream();
        store.record(a).await.unwrap();
        assert!(store.is_throttled(a).await.unwrap());
        assert!(!store.is_throttled(b).await.unwrap());
    }

    #[test]
    fn key_formats_match_contract() {
        let sid = Uuid::nil();
        assert_eq!(
            dedup_key(sid, "bomb", "fuzzy"),
            format!("dedup:{sid}:bomb:fuzzy")
        );
        assert_eq!(throttle_key(sid), format!("throttle:{sid}"));
    }
}
