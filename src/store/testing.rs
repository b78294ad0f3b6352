//! Store double that fails chosen operations while reporting itself up.
//!
//! `MemoryStore::set_available(false)` fails everything and flips
//! `is_available`, so callers short-circuit before touching the store. This
//! double keeps `is_available` true and fails only the named operations,
//! which is what a dropped connection mid-scan looks like.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{MemoryStore, Store};
use crate::error::StoreError;

#[derive(Default)]
pub(crate) struct FaultyStore {
    inner: MemoryStore,
    /// Remaining successful calls per operation before it starts failing.
    faults: Mutex<HashMap<&'static str, usize>>,
}

impl FaultyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fails every further call to `op`.
    pub(crate) fn fail(&self, op: &'static str) {
        self.fail_after(op, 0);
    }

    /// Lets `successes` more calls to `op` through, then fails the rest.
    pub(crate) fn fail_after(&self, op: &'static str, successes: usize) {
        self.faults.lock().unwrap().insert(op, successes);
    }

    pub(crate) fn heal(&self, op: &'static str) {
        self.faults.lock().unwrap().remove(op);
    }

    fn check(&self, op: &'static str) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().unwrap();
        match faults.get_mut(op) {
            Some(0) => Err(StoreError::Backend(format!("{} failed: connection reset", op))),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Store for FaultyStore {
    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check("lpush")?;
        self.inner.lpush(key, value).await
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        self.check("brpop")?;
        self.inner.brpop(key, timeout).await
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        self.check("llen")?;
        self.inner.llen(key).await
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        self.check("lrange")?;
        self.inner.lrange(key, start, stop).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check("del")?;
        self.inner.del(key).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.check("zadd")?;
        self.inner.zadd(key, member, score).await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.check("zrange_by_score")?;
        self.inner.zrange_by_score(key, max, limit).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check("zrem")?;
        self.inner.zrem(key, member).await
    }

    async fn zrem_lpush(&self, from: &str, member: &str, to: &str) -> Result<bool, StoreError> {
        self.check("zrem_lpush")?;
        self.inner.zrem_lpush(from, member, to).await
    }

    async fn rpop_lpush_if(
        &self,
        from: &str,
        expected: &str,
        push: Option<(&str, &str)>,
    ) -> Result<bool, StoreError> {
        self.check("rpop_lpush_if")?;
        self.inner.rpop_lpush_if(from, expected, push).await
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        self.check("zcard")?;
        self.inner.zcard(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check("get")?;
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check("exists")?;
        self.inner.exists(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check("set_ex")?;
        self.inner.set_ex(key, value, ttl).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check("set_nx_ex")?;
        self.inner.set_nx_ex(key, value, ttl).await
    }
}
