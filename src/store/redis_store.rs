//! Redis-backed store.
//!
//! Commands go through a `ConnectionManager`, which reconnects automatically.
//! Blocking pops use dedicated connections: a `BRPOP` parked on the shared
//! connection would hold up every other command queued behind it. Each pop
//! checks a connection out of a small idle pool and returns it afterwards, so
//! a worker polling every few seconds reuses one socket.
//!
//! Moves between keys (`zrem_lpush`, `rpop_lpush_if`) run as Lua scripts so
//! a task is never out of both its source and its destination.
//!
//! Availability is tracked from command outcomes. Connection-level failures
//! (I/O, refused, dropped, timeout) mark the store unavailable so producers
//! degrade to synchronous delivery; the next successful command clears it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{RedisError, RedisResult, Script};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::Store;
use crate::error::StoreError;

/// Idle blocking connections kept for reuse; extras are closed.
const MAX_IDLE_BLOCKING: usize = 32;

/// Moves a sorted-set member onto a list if it is still in the set.
const ZREM_LPUSH_SCRIPT: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
    redis.call('LPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
";

/// Pops a list tail if it matches, optionally pushing a replacement elsewhere.
const RPOP_LPUSH_IF_SCRIPT: &str = r"
if redis.call('LINDEX', KEYS[1], -1) ~= ARGV[1] then
    return 0
end
redis.call('RPOP', KEYS[1])
if #KEYS > 1 then
    redis.call('LPUSH', KEYS[2], ARGV[2])
end
return 1
";

/// Redis implementation of [`Store`].
pub struct RedisStore {
    client: redis::Client,
    redis: ConnectionManager,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    promote_script: Script,
    requeue_script: Script,
    available: AtomicBool,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client.clone()).await?;

        Ok(Self {
            client,
            redis,
            blocking: Mutex::new(Vec::new()),
            promote_script: Script::new(ZREM_LPUSH_SCRIPT),
            requeue_script: Script::new(RPOP_LPUSH_IF_SCRIPT),
            available: AtomicBool::new(true),
        })
    }

    /// Takes an idle blocking connection, or opens a new one.
    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        let idle = self.blocking.lock().await.pop();
        match idle {
            Some(conn) => Ok(conn),
            None => {
                debug!("Opening blocking Redis connection");
                self.track(self.client.get_multiplexed_async_connection().await)
            }
        }
    }

    /// Returns a healthy blocking connection to the idle pool.
    async fn checkin_blocking(&self, conn: MultiplexedConnection) {
        let mut idle = self.blocking.lock().await;
        if idle.len() < MAX_IDLE_BLOCKING {
            idle.push(conn);
        }
    }

    /// Records the outcome of a command against the availability flag.
    fn track<T>(&self, result: RedisResult<T>) -> Result<T, StoreError> {
        match result {
            Ok(value) => {
                if !self.available.swap(true, Ordering::SeqCst) {
                    info!("Redis connection restored");
                }
                Ok(value)
            }
            Err(e) => {
                if is_connection_error(&e) && self.available.swap(false, Ordering::SeqCst) {
                    warn!(error = %e, "Redis marked unavailable");
                }
                Err(StoreError::Redis(e))
            }
        }
    }

    /// Inspects the server's persistence settings.
    ///
    /// Queue contents only survive a Redis restart when AOF (or at least RDB
    /// snapshots) is enabled; a warning is logged otherwise.
    pub async fn persistence_report(&self) -> Result<PersistenceReport, StoreError> {
        let mut conn = self.redis.clone();

        let info: String = self.track(
            redis::cmd("INFO")
                .arg("persistence")
                .query_async(&mut conn)
                .await,
        )?;

        let hybrid: Vec<String> = self
            .track(
                redis::cmd("CONFIG")
                    .arg("GET")
                    .arg("aof-use-rdb-preamble")
                    .query_async(&mut conn)
                    .await,
            )
            .unwrap_or_default();

        let mut report = PersistenceReport::from_info(&info);
        report.hybrid_enabled = hybrid.get(1).map(|v| v == "yes").unwrap_or(false);

        if report.aof_enabled {
            info!("Redis AOF persistence is enabled");
        } else {
            warn!(
                "Redis AOF persistence is disabled; queued mail may be lost on restart \
                 (recommended: appendonly yes, appendfsync everysec, aof-use-rdb-preamble yes)"
            );
        }
        if let Some(ref last_save) = report.last_save {
            info!(last_save = %last_save, "Redis last RDB save");
        }

        Ok(report)
    }
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl Store for RedisStore {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        self.track(
            redis::cmd("LPUSH")
                .arg(key)
                .arg(value)
                .query_async::<_, ()>(&mut conn)
                .await,
        )
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let mut conn = self.checkout_blocking().await?;
        let timeout_secs = timeout.as_secs().max(1);

        let result: RedisResult<Option<(String, String)>> = redis::cmd("BRPOP")
            .arg(key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await;
        // A connection that errored is dropped rather than reused.
        if result.is_ok() {
            self.checkin_blocking(conn).await;
        }

        let popped = self.track(result)?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        self.track(redis::cmd("LLEN").arg(key).query_async(&mut conn).await)
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        self.track(
            redis::cmd("LRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .query_async(&mut conn)
                .await,
        )
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        self.track(
            redis::cmd("DEL")
                .arg(key)
                .query_async::<_, ()>(&mut conn)
                .await,
        )
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        self.track(
            redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async::<_, ()>(&mut conn)
                .await,
        )
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let mut conn = self.redis.clone();
        self.track(
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(max)
                .arg("WITHSCORES")
                .arg("LIMIT")
                .arg(0)
                .arg(limit)
                .query_async(&mut conn)
                .await,
        )
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = self.track(
            redis::cmd("ZREM")
                .arg(key)
                .arg(member)
                .query_async(&mut conn)
                .await,
        )?;
        Ok(removed > 0)
    }

    async fn zrem_lpush(&self, from: &str, member: &str, to: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let moved: i64 = self.track(
            self.promote_script
                .key(from)
                .key(to)
                .arg(member)
                .invoke_async(&mut conn)
                .await,
        )?;
        Ok(moved == 1)
    }

    async fn rpop_lpush_if(
        &self,
        from: &str,
        expected: &str,
        push: Option<(&str, &str)>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let mut invocation = self.requeue_script.key(from);
        invocation.arg(expected);
        if let Some((to, value)) = push {
            invocation.key(to).arg(value);
        }

        let moved: i64 = self.track(invocation.invoke_async(&mut conn).await)?;
        Ok(moved == 1)
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        self.track(redis::cmd("ZCARD").arg(key).query_async(&mut conn).await)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        self.track(redis::cmd("GET").arg(key).query_async(&mut conn).await)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        self.track(redis::cmd("EXISTS").arg(key).query_async(&mut conn).await)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        self.track(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs(ttl))
                .query_async::<_, ()>(&mut conn)
                .await,
        )
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let reply: Option<String> = self.track(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs(ttl))
                .arg("NX")
                .query_async(&mut conn)
                .await,
        )?;
        Ok(reply.is_some())
    }
}

/// Summary of the Redis server's persistence configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistenceReport {
    /// Append-only file enabled.
    pub aof_enabled: bool,
    /// RDB snapshotting reported by the server.
    pub rdb_enabled: bool,
    /// AOF with an RDB preamble.
    pub hybrid_enabled: bool,
    /// Time of the last RDB save, formatted `%Y-%m-%d %H:%M:%S` (UTC).
    pub last_save: Option<String>,
}

impl PersistenceReport {
    /// Parses the output of `INFO persistence`.
    pub fn from_info(info: &str) -> Self {
        let last_save = info
            .lines()
            .find_map(|line| line.trim().strip_prefix("rdb_last_save_time:"))
            .and_then(|ts| ts.trim().parse::<i64>().ok())
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string());

        Self {
            aof_enabled: info.contains("aof_enabled:1"),
            rdb_enabled: info.contains("rdb_changes_since_last_save:"),
            hybrid_enabled: false,
            last_save,
        }
    }
}
