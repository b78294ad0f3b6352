//! In-process store with the same semantics as the Redis backend.
//!
//! All state sits behind one mutex, so every primitive is atomic with respect
//! to the others, the same guarantee single-threaded Redis gives. Expiry runs
//! on the tokio clock, which lets tests drive TTLs with a paused runtime.
//! Expired string keys are dropped lazily on read and swept in bulk at most
//! once per [`SWEEP_INTERVAL`] on write.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ordered_float::OrderedFloat;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::Store;
use crate::error::StoreError;

/// Minimum spacing between bulk sweeps of expired string keys.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, OrderedFloat<f64>>,
    ordered: BTreeSet<(OrderedFloat<f64>, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) {
        let score = OrderedFloat(score);
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(previous, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }
}

struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, SortedSet>,
    strings: HashMap<String, StringEntry>,
    next_sweep: Option<Instant>,
}

impl Inner {
    /// Drops every expired string key, at most once per sweep interval.
    ///
    /// Markers are written once and rarely read back, so lazy expiry alone
    /// would keep them forever.
    fn sweep_expired(&mut self, now: Instant) {
        match self.next_sweep {
            Some(at) if now < at => return,
            Some(_) => self.strings.retain(|_, entry| entry.is_live(now)),
            None => {}
        }
        self.next_sweep = Some(now + SWEEP_INTERVAL);
    }

    fn insert_string(&mut self, key: &str, value: &str, ttl: Duration) {
        let now = Instant::now();
        self.sweep_expired(now);
        self.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
    }

    fn live_string(&mut self, key: &str) -> Option<&StringEntry> {
        let now = Instant::now();
        if self.strings.get(key).is_some_and(|e| !e.is_live(now)) {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }
}

/// In-memory implementation of [`Store`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pushed: Notify,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            pushed: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the store going down or coming back.
    ///
    /// While unavailable every operation fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            self.pushed.notify_waiters();
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn try_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock()?;
        let popped = inner.lists.get_mut(key).and_then(|list| list.pop_back());
        if inner.lists.get(key).is_some_and(|list| list.is_empty()) {
            inner.lists.remove(key);
        }
        Ok(popped)
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()?
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(key)? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.lock()?.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.lock()?;
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };

        let len = list.len() as isize;
        let resolve = |index: isize| if index < 0 { len + index } else { index };
        let start = resolve(start).max(0);
        let stop = resolve(stop).min(len - 1);
        if start > stop {
            return Ok(Vec::new());
        }

        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.lists.remove(key);
        inner.zsets.remove(key);
        inner.strings.remove(key);
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.lock()?
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let inner = self.lock()?;
        let Some(set) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };

        Ok(set
            .ordered
            .iter()
            .take_while(|(score, _)| score.0 <= max)
            .take(limit)
            .map(|(score, member)| (member.clone(), score.0))
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        Ok(inner
            .zsets
            .get_mut(key)
            .is_some_and(|set| set.remove(member)))
    }

    async fn zrem_lpush(&self, from: &str, member: &str, to: &str) -> Result<bool, StoreError> {
        {
            let mut inner = self.lock()?;
            let removed = inner
                .zsets
                .get_mut(from)
                .is_some_and(|set| set.remove(member));
            if !removed {
                return Ok(false);
            }
            inner
                .lists
                .entry(to.to_string())
                .or_default()
                .push_front(member.to_string());
        }
        self.pushed.notify_waiters();
        Ok(true)
    }

    async fn rpop_lpush_if(
        &self,
        from: &str,
        expected: &str,
        push: Option<(&str, &str)>,
    ) -> Result<bool, StoreError> {
        {
            let mut inner = self.lock()?;
            let Some(list) = inner.lists.get_mut(from) else {
                return Ok(false);
            };
            if list.back().map(String::as_str) != Some(expected) {
                return Ok(false);
            }
            list.pop_back();
            if list.is_empty() {
                inner.lists.remove(from);
            }
            if let Some((to, value)) = push {
                inner
                    .lists
                    .entry(to.to_string())
                    .or_default()
                    .push_front(value.to_string());
            }
        }
        if push.is_some() {
            self.pushed.notify_waiters();
        }
        Ok(true)
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.lock()?.zsets.get(key).map_or(0, |set| set.scores.len()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.live_string(key).map(|e| e.value.clone()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        Ok(inner.live_string(key).is_some()
            || inner.lists.contains_key(key)
            || inner.zsets.contains_key(key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.lock()?.insert_string(key, value, ttl);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        if inner.live_string(key).is_some() {
            return Ok(false);
        }
        inner.insert_string(key, value, ttl);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_list_is_fifo() {
        let store = MemoryStore::new();
        store.lpush("q", "a").await.unwrap();
        store.lpush("q", "b").await.unwrap();
        store.lpush("q", "c").await.unwrap();

        assert_eq!(store.llen("q").await.unwrap(), 3);
        assert_eq!(
            store.lrange("q", 0, -1).await.unwrap(),
            vec!["c".to_string(), "b".to_string(), "a".to_string()]
        );

        let timeout = Duration::from_millis(10);
        assert_eq!(store.brpop("q", timeout).await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.brpop("q", timeout).await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.brpop("q", timeout).await.unwrap().as_deref(), Some("c"));
        assert_eq!(store.llen("q").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_brpop_times_out_on_empty_list() {
        let store = MemoryStore::new();
        let start = Instant::now();

        let popped = store.brpop("q", Duration::from_secs(5)).await.unwrap();

        assert!(popped.is_none());
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_brpop_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.brpop("q", Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        store.lpush("q", "late").await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_lrange_bounds() {
        let store = MemoryStore::new();
        for v in ["1", "2", "3", "4"] {
            store.lpush("l", v).await.unwrap();
        }

        assert_eq!(store.lrange("l", 0, 1).await.unwrap(), vec!["4", "3"]);
        assert_eq!(store.lrange("l", -2, -1).await.unwrap(), vec!["2", "1"]);
        assert!(store.lrange("l", 3, 1).await.unwrap().is_empty());
        assert!(store.lrange("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sorted_set_ordering_and_limit() {
        let store = MemoryStore::new();
        store.zadd("z", "late", 300.0).await.unwrap();
        store.zadd("z", "early", 100.0).await.unwrap();
        store.zadd("z", "middle", 200.0).await.unwrap();

        let due = store.zrange_by_score("z", 250.0, 10).await.unwrap();
        assert_eq!(
            due,
            vec![("early".to_string(), 100.0), ("middle".to_string(), 200.0)]
        );

        let limited = store.zrange_by_score("z", 1000.0, 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        // Re-scoring moves the member instead of duplicating it.
        store.zadd("z", "late", 50.0).await.unwrap();
        assert_eq!(store.zcard("z").await.unwrap(), 3);
        let first = store.zrange_by_score("z", 1000.0, 1).await.unwrap();
        assert_eq!(first[0].0, "late");
    }

    #[tokio::test]
    async fn test_zrem_reports_presence_once() {
        let store = MemoryStore::new();
        store.zadd("z", "m", 1.0).await.unwrap();

        assert!(store.zrem("z", "m").await.unwrap());
        assert!(!store.zrem("z", "m").await.unwrap());
        assert_eq!(store.zcard("z").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_string_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_respects_live_key_only() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);

        assert!(store.set_nx_ex("k", "first", ttl).await.unwrap());
        assert!(!store.set_nx_ex("k", "second", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("first"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.set_nx_ex("k", "third", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("third"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_markers_are_swept_on_write() {
        let store = MemoryStore::new();
        for i in 0..1000 {
            store
                .set_ex(&format!("marker:{}", i), "sent", Duration::from_secs(1))
                .await
                .unwrap();
        }

        tokio::time::advance(Duration::from_secs(3600)).await;
        for i in 0..10 {
            store
                .set_nx_ex(&format!("fresh:{}", i), "processing", Duration::from_secs(600))
                .await
                .unwrap();
        }

        assert_eq!(store.inner.lock().unwrap().strings.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_live_keys() {
        let store = MemoryStore::new();
        store.set_ex("short", "v", Duration::from_secs(1)).await.unwrap();
        store.set_ex("long", "v", Duration::from_secs(3600)).await.unwrap();

        tokio::time::advance(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        store.set_ex("new", "v", Duration::from_secs(10)).await.unwrap();

        let inner = store.inner.lock().unwrap();
        assert!(!inner.strings.contains_key("short"));
        assert!(inner.strings.contains_key("long"));
        assert!(inner.strings.contains_key("new"));
    }

    #[tokio::test]
    async fn test_zrem_lpush_moves_member_once() {
        let store = MemoryStore::new();
        store.zadd("z", "task", 1.0).await.unwrap();

        assert!(store.zrem_lpush("z", "task", "q").await.unwrap());
        assert!(!store.zrem_lpush("z", "task", "q").await.unwrap());

        assert_eq!(store.zcard("z").await.unwrap(), 0);
        assert_eq!(store.lrange("q", 0, -1).await.unwrap(), vec!["task"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zrem_lpush_wakes_blocked_pop() {
        let store = Arc::new(MemoryStore::new());
        store.zadd("z", "task", 1.0).await.unwrap();
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.brpop("q", Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        store.zrem_lpush("z", "task", "q").await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.as_deref(), Some("task"));
    }

    #[tokio::test]
    async fn test_rpop_lpush_if_compares_tail() {
        let store = MemoryStore::new();
        store.lpush("failed", "old").await.unwrap();
        store.lpush("failed", "new").await.unwrap();

        assert!(!store
            .rpop_lpush_if("failed", "new", Some(("q", "x")))
            .await
            .unwrap());
        assert!(store
            .rpop_lpush_if("failed", "old", Some(("q", "reset")))
            .await
            .unwrap());
        assert!(store.rpop_lpush_if("failed", "new", None).await.unwrap());

        assert_eq!(store.llen("failed").await.unwrap(), 0);
        assert_eq!(store.lrange("q", 0, -1).await.unwrap(), vec!["reset"]);
        assert!(!store.rpop_lpush_if("failed", "new", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_del_removes_any_type() {
        let store = MemoryStore::new();
        store.lpush("x", "1").await.unwrap();
        store.del("x").await.unwrap();
        assert_eq!(store.llen("x").await.unwrap(), 0);
        assert!(!store.exists("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_operations() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(!store.is_available());
        assert!(matches!(
            store.lpush("q", "v").await,
            Err(StoreError::Unavailable)
        ));
        assert!(matches!(
            store.llen("q").await,
            Err(StoreError::Unavailable)
        ));

        store.set_available(true);
        assert!(store.lpush("q", "v").await.is_ok());
    }
}
