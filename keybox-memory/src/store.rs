//! Moka backed [`Store`] implementation.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use keybox_backend::{
    BatchWrite, DeleteStatus, ScoredMember, Store, StoreError, StoreResult, StoredEntry,
};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

use crate::glob;
use crate::metrics;
use crate::pubsub::MemoryMessage;

#[derive(Debug)]
enum Value {
    Entry(StoredEntry),
    Set(BTreeSet<String>),
    Sorted(HashMap<String, f64>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Entry(_) => "hash",
            Value::Set(_) => "set",
            Value::Sorted(_) => "zset",
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Value::Entry(_) => false,
            Value::Set(members) => members.is_empty(),
            Value::Sorted(members) => members.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    value: Value,
    deadline: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

type SlotRef = Arc<Mutex<Slot>>;

/// Expiry instant for `ttl`. A TTL past the clock's range never expires.
fn deadline(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

fn lock(slot: &SlotRef) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn wrong_type(key: &str, found: &Value) -> StoreError {
    StoreError::fatal(format!(
        "WRONGTYPE key `{key}` holds a {} value",
        found.type_name()
    ))
}

/// One logical in-memory database.
///
/// Handles are cheap to clone; all clones see the same data.
#[derive(Clone)]
pub struct MemoryStore {
    cache: Cache<String, SlotRef>,
    publisher: broadcast::Sender<MemoryMessage>,
    label: String,
    db: i64,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("label", &self.label)
            .field("db", &self.db)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl MemoryStore {
    pub(crate) fn new(
        label: String,
        db: i64,
        max_entries: Option<u64>,
        eviction_policy: EvictionPolicy,
        publisher: broadcast::Sender<MemoryMessage>,
    ) -> Self {
        let mut builder = Cache::builder().eviction_policy(eviction_policy);
        if let Some(capacity) = max_entries {
            builder = builder.max_capacity(capacity);
        }
        Self {
            cache: builder.build(),
            publisher,
            label,
            db,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> u64 {
        let now = Instant::now();
        self.cache
            .iter()
            .filter(|(_, slot)| !lock(slot).is_expired(now))
            .count() as u64
    }

    /// Returns `true` when the database holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies pending evictions. Moka runs these lazily otherwise.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }

    /// Drops every key.
    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        metrics::record_capacity(&self.label, self.db, 0);
    }

    fn live(&self, key: &str) -> Option<SlotRef> {
        let slot = self.cache.get(key)?;
        let expired = lock(&slot).is_expired(Instant::now());
        if expired {
            self.evict_if(key, |slot| slot.is_expired(Instant::now()));
            None
        } else {
            Some(slot)
        }
    }

    /// Removes `key` if `condition` still holds once it is detached.
    fn evict_if(&self, key: &str, condition: impl Fn(&Slot) -> bool) {
        if let Some(slot) = self.cache.remove(key) {
            let keep = !condition(&lock(&slot));
            if keep {
                self.cache.insert(key.to_owned(), slot);
            }
        }
    }

    /// Slot for a collection write. Expired slots are reset in place.
    fn collection(&self, key: &str, empty: fn() -> Value) -> SlotRef {
        let slot = self
            .cache
            .entry(key.to_owned())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot {
                    value: empty(),
                    deadline: None,
                }))
            })
            .into_value();
        {
            let mut guard = lock(&slot);
            if guard.is_expired(Instant::now()) {
                guard.value = empty();
                guard.deadline = None;
            }
        }
        slot
    }

    fn insert(&self, key: &str, entry: StoredEntry, ttl: Option<Duration>) {
        let slot = Slot {
            value: Value::Entry(entry),
            deadline: ttl.and_then(deadline),
        };
        self.cache.insert(key.to_owned(), Arc::new(Mutex::new(slot)));
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<Duration> {
        let started = std::time::Instant::now();
        let _ = self.cache.entry_count();
        Ok(started.elapsed())
    }

    async fn read(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        let Some(slot) = self.live(key) else {
            return Ok(None);
        };
        let guard = lock(&slot);
        match &guard.value {
            Value::Entry(entry) => Ok(Some(entry.clone())),
            other => Err(wrong_type(key, other)),
        }
    }

    async fn write(&self, key: &str, entry: StoredEntry, ttl: Option<Duration>) -> StoreResult<()> {
        self.insert(key, entry, ttl);
        metrics::record_capacity(&self.label, self.db, self.cache.entry_count());
        Ok(())
    }

    async fn write_batch(&self, writes: Vec<BatchWrite>) -> StoreResult<Vec<bool>> {
        let written = writes.len();
        for write in writes {
            self.insert(&write.key, write.entry, write.ttl);
        }
        metrics::record_capacity(&self.label, self.db, self.cache.entry_count());
        Ok(vec![true; written])
    }

    async fn remove(&self, key: &str) -> StoreResult<DeleteStatus> {
        match self.cache.remove(key) {
            Some(slot) if !lock(&slot).is_expired(Instant::now()) => Ok(DeleteStatus::Deleted(1)),
            _ => Ok(DeleteStatus::Missing),
        }
    }

    async fn remove_batch(&self, keys: &[String]) -> StoreResult<u64> {
        let now = Instant::now();
        let removed = keys
            .iter()
            .filter_map(|key| self.cache.remove(key))
            .filter(|slot| !lock(slot).is_expired(now))
            .count();
        Ok(removed as u64)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.live(key).is_some())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let Some(slot) = self.live(key) else {
            return Ok(None);
        };
        let deadline = lock(&slot).deadline;
        Ok(deadline.map(|deadline| deadline.saturating_duration_since(Instant::now())))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let Some(slot) = self.live(key) else {
            return Ok(false);
        };
        lock(&slot).deadline = deadline(ttl);
        Ok(true)
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let matcher = glob::compile(pattern).map_err(StoreError::validation)?;
        let now = Instant::now();
        let mut keys = Vec::new();
        let mut expired = Vec::new();
        for (key, slot) in self.cache.iter() {
            if lock(&slot).is_expired(now) {
                expired.push(key);
            } else if matcher.is_match(&key) {
                keys.push(key.as_ref().clone());
            }
        }
        for key in expired {
            self.evict_if(&key, |slot| slot.is_expired(now));
        }
        trace!(store = %self.label, pattern, found = keys.len(), "Scan complete");
        Ok(keys)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<()> {
        let slot = self.collection(key, || Value::Set(BTreeSet::new()));
        let mut guard = lock(&slot);
        match &mut guard.value {
            Value::Set(members) => {
                members.insert(member.to_owned());
            }
            other => return Err(wrong_type(key, other)),
        }
        guard.deadline = deadline(ttl);
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let Some(slot) = self.live(key) else {
            return Ok(Vec::new());
        };
        let guard = lock(&slot);
        match &guard.value {
            Value::Set(members) => Ok(members.iter().cloned().collect()),
            other => Err(wrong_type(key, other)),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let Some(slot) = self.live(key) else {
            return Ok(false);
        };
        let (removed, now_empty) = {
            let mut guard = lock(&slot);
            match &mut guard.value {
                Value::Set(members) => (members.remove(member), members.is_empty()),
                other => return Err(wrong_type(key, other)),
            }
        };
        if now_empty {
            self.evict_if(key, |slot| slot.value.is_empty());
        }
        Ok(removed)
    }

    async fn sorted_add(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Duration,
    ) -> StoreResult<()> {
        let slot = self.collection(key, || Value::Sorted(HashMap::new()));
        let mut guard = lock(&slot);
        match &mut guard.value {
            Value::Sorted(members) => {
                members.insert(member.to_owned(), score);
            }
            other => return Err(wrong_type(key, other)),
        }
        guard.deadline = deadline(ttl);
        Ok(())
    }

    async fn sorted_range(&self, key: &str) -> StoreResult<Vec<ScoredMember>> {
        let Some(slot) = self.live(key) else {
            return Ok(Vec::new());
        };
        let guard = lock(&slot);
        let Value::Sorted(members) = &guard.value else {
            return Err(wrong_type(key, &guard.value));
        };
        let mut range: Vec<ScoredMember> = members
            .iter()
            .map(|(member, score)| ScoredMember {
                member: member.clone(),
                score: *score,
            })
            .collect();
        range.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.member.cmp(&b.member))
        });
        Ok(range)
    }

    async fn sorted_remove_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<u64> {
        let Some(slot) = self.live(key) else {
            return Ok(0);
        };
        let (removed, now_empty) = {
            let mut guard = lock(&slot);
            let members = match &mut guard.value {
                Value::Sorted(members) => members,
                other => return Err(wrong_type(key, other)),
            };
            let before = members.len();
            members.retain(|_, score| *score < min || *score > max);
            ((before - members.len()) as u64, members.is_empty())
        };
        if now_empty {
            self.evict_if(key, |slot| slot.value.is_empty());
        }
        Ok(removed)
    }

    async fn publish(&self, channel: &str, message: &[u8]) -> StoreResult<u64> {
        let message = MemoryMessage {
            channel: channel.to_owned(),
            payload: Bytes::copy_from_slice(message),
        };
        // No receivers is not an error, Redis reports zero as well.
        Ok(self.publisher.send(message).map_or(0, |receivers| receivers as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        let (publisher, _) = broadcast::channel(8);
        MemoryStore::new("test".into(), 0, None, EvictionPolicy::lru(), publisher)
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = store();
        let entry = StoredEntry::new(Bytes::from_static(b"\0value"));
        store
            .write("k", entry.clone(), Some(Duration::from_secs(2)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.read("k").await.unwrap(), Some(entry));
        assert_eq!(store.ttl("k").await.unwrap(), Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.read("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expire_rearms_live_keys_only() {
        let store = store();
        store
            .write("k", StoredEntry::new(Bytes::from_static(b"\0v")), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(store.expire("k", Duration::from_secs(10)).await.unwrap());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.exists("k").await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn unbounded_ttl_never_expires() {
        let store = store();
        store
            .write("k", StoredEntry::new(Bytes::from_static(b"\0v")), Some(Duration::MAX))
            .await
            .unwrap();
        store.sorted_add("z", "m", 1.0, Duration::MAX).await.unwrap();
        assert!(store.expire("k", Duration::MAX).await.unwrap());

        assert_eq!(store.ttl("k").await.unwrap(), None);
        assert!(store.exists("z").await.unwrap());
    }

    #[tokio::test]
    async fn wrong_type_is_fatal() {
        let store = store();
        store
            .sorted_add("z", "m", 1.0, Duration::from_secs(60))
            .await
            .unwrap();
        let error = store.read("z").await.unwrap_err();
        assert_eq!(error.kind(), keybox_backend::FaultKind::Fatal);
    }

    #[tokio::test]
    async fn sorted_set_range_and_removal() {
        let store = store();
        let ttl = Duration::from_secs(60);
        store.sorted_add("z", "b", 2.0, ttl).await.unwrap();
        store.sorted_add("z", "a", 1.0, ttl).await.unwrap();
        store.sorted_add("z", "c", 3.0, ttl).await.unwrap();

        let members: Vec<_> = store
            .sorted_range("z")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.member)
            .collect();
        assert_eq!(members, ["a", "b", "c"]);

        let removed = store
            .sorted_remove_range_by_score("z", f64::NEG_INFINITY, 2.0)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.sorted_range("z").await.unwrap().len(), 1);

        store
            .sorted_remove_range_by_score("z", f64::NEG_INFINITY, f64::INFINITY)
            .await
            .unwrap();
        assert!(!store.exists("z").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_collections_restart_empty() {
        let store = store();
        store.set_add("s", "old", Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        store.set_add("s", "new", Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), ["new"]);
    }

    #[tokio::test]
    async fn scan_matches_glob() {
        let store = store();
        for key in ["app:a", "app:b", "other:c"] {
            store
                .write(key, StoredEntry::new(Bytes::from_static(b"\0")), None)
                .await
                .unwrap();
        }
        let mut keys = store.scan("app:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, ["app:a", "app:b"]);
    }
}
