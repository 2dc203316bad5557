//! Single-process [`KvStore`] with the same semantics as the Redis backend.
//!
//! Expiry uses the tokio clock and is applied lazily on access, so tests can
//! drive TTLs with `tokio::time::pause` and `advance`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::memory::core::errors::{MemoryError, MemoryResult};
use crate::memory::kv::store::{KvFuture, KvStore, KvWrite, TxnPlan};

#[derive(Clone, Debug)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn get_str(&mut self, key: &str) -> MemoryResult<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(MemoryError::WrongType(key.to_string())),
        }
    }

    fn list(&mut self, key: &str) -> MemoryResult<Option<&mut VecDeque<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(Some(items)),
            Some(_) => Err(MemoryError::WrongType(key.to_string())),
        }
    }

    fn set(&mut self, key: String, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(
            key,
            Entry {
                value: Value::Str(value),
                expires_at,
            },
        );
    }

    fn remove(&mut self, key: &str) -> bool {
        self.live(key).is_some() && self.entries.remove(key).is_some()
    }

    fn apply(&mut self, writes: Vec<KvWrite>) {
        for write in writes {
            match write {
                KvWrite::Set { key, value, ttl } => self.set(key, value, ttl),
                KvWrite::Delete { key } => {
                    self.remove(&key);
                }
            }
        }
    }
}

/// Resolve Redis `LRANGE` indices against a list length.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = i64::try_from(len).ok()?;
    let start = if start < 0 { (start + len).max(0) } else { start };
    let stop = if stop < 0 { stop + len } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

/// In-memory key-value store.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    inner: Mutex<Keyspace>,
}

impl InMemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let guard = self.inner.lock().await;
        guard.entries.values().filter(|e| e.is_live(now)).count()
    }

    /// Whether the store holds no live key.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remaining TTL of a key, if it has one.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        guard
            .live(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

impl KvStore for InMemoryKvStore {
    fn get(&self, key: &str) -> KvFuture<'_, MemoryResult<Option<String>>> {
        let key = key.to_string();
        Box::pin(async move { self.inner.lock().await.get_str(&key) })
    }

    fn get_many(&self, keys: Vec<String>) -> KvFuture<'_, MemoryResult<Vec<Option<String>>>> {
        Box::pin(async move {
            let mut guard = self.inner.lock().await;
            // MGET reports non-string keys as missing.
            Ok(keys
                .iter()
                .map(|key| guard.get_str(key).ok().flatten())
                .collect())
        })
    }

    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> KvFuture<'_, MemoryResult<()>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            self.inner.lock().await.set(key, value, ttl);
            Ok(())
        })
    }

    fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> KvFuture<'_, MemoryResult<bool>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut guard = self.inner.lock().await;
            if guard.live(&key).is_some() {
                return Ok(false);
            }
            guard.set(key, value, ttl);
            Ok(true)
        })
    }

    fn delete(&self, keys: Vec<String>) -> KvFuture<'_, MemoryResult<u64>> {
        Box::pin(async move {
            let mut guard = self.inner.lock().await;
            let mut removed = 0;
            for key in &keys {
                if guard.remove(key) {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn exists(&self, key: &str) -> KvFuture<'_, MemoryResult<bool>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.inner.lock().await.live(&key).is_some()) })
    }

    fn push_back(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> KvFuture<'_, MemoryResult<u64>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            let mut guard = self.inner.lock().await;
            let now = Instant::now();
            if guard.list(&key)?.is_none() {
                guard.entries.insert(
                    key.clone(),
                    Entry {
                        value: Value::List(VecDeque::new()),
                        expires_at: None,
                    },
                );
            }
            let entry = guard
                .entries
                .get_mut(&key)
                .ok_or_else(|| MemoryError::WrongType(key.clone()))?;
            if let Some(ttl) = ttl {
                entry.expires_at = Some(now + ttl);
            }
            let Value::List(items) = &mut entry.value else {
                return Err(MemoryError::WrongType(key));
            };
            items.push_back(value);
            Ok(items.len() as u64)
        })
    }

    fn list_len(&self, key: &str) -> KvFuture<'_, MemoryResult<u64>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut guard = self.inner.lock().await;
            Ok(guard.list(&key)?.map_or(0, |items| items.len() as u64))
        })
    }

    fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> KvFuture<'_, MemoryResult<Vec<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut guard = self.inner.lock().await;
            let Some(items) = guard.list(&key)? else {
                return Ok(Vec::new());
            };
            let Some((from, to)) = resolve_range(items.len(), start, stop) else {
                return Ok(Vec::new());
            };
            Ok(items.range(from..=to).cloned().collect())
        })
    }

    fn drain_list(&self, key: &str) -> KvFuture<'_, MemoryResult<Vec<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut guard = self.inner.lock().await;
            let items: Vec<String> = guard
                .list(&key)?
                .map(|items| items.drain(..).collect())
                .unwrap_or_default();
            guard.entries.remove(&key);
            Ok(items)
        })
    }

    fn scan_keys(&self, prefix: &str) -> KvFuture<'_, MemoryResult<Vec<String>>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let now = Instant::now();
            let guard = self.inner.lock().await;
            let mut keys: Vec<String> = guard
                .entries
                .iter()
                .filter(|(key, entry)| key.starts_with(&prefix) && entry.is_live(now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn watch_and_commit(
        &self,
        keys: Vec<String>,
        plan: TxnPlan,
    ) -> KvFuture<'_, MemoryResult<bool>> {
        Box::pin(async move {
            // The keyspace lock is held from read to write, so no watched key
            // can change in between.
            let mut guard = self.inner.lock().await;
            let current: Vec<Option<String>> = keys
                .iter()
                .map(|key| guard.get_str(key).ok().flatten())
                .collect();
            let Some(writes) = plan(&current) else {
                return Ok(false);
            };
            guard.apply(writes);
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_range_matches_lrange() {
        assert_eq!(resolve_range(5, 0, -1), Some((0, 4)));
        assert_eq!(resolve_range(5, -2, -1), Some((3, 4)));
        assert_eq!(resolve_range(5, 3, 100), Some((3, 4)));
        assert_eq!(resolve_range(5, -100, 1), Some((0, 1)));
        assert_eq!(resolve_range(5, 5, 10), None);
        assert_eq!(resolve_range(5, 3, 2), None);
        assert_eq!(resolve_range(0, 0, -1), None);
    }

    #[tokio::test]
    async fn test_set_nx_only_once() {
        let store = InMemoryKvStore::new();
        assert!(store.set_nx("k", "1", Some(Duration::from_secs(5))).await.unwrap());
        assert!(!store.set_nx("k", "2", Some(Duration::from_secs(5))).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_uses_tokio_clock() {
        let store = InMemoryKvStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(2)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(1_999)).await;
        assert!(store.exists("k").await.unwrap());
        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(store.set_nx("k", "w", Some(Duration::from_secs(1))).await.unwrap());
    }

    #[tokio::test]
    async fn test_lists() {
        let store = InMemoryKvStore::new();
        for value in ["a", "b", "c"] {
            store.push_back("l", value, None).await.unwrap();
        }
        assert_eq!(store.list_len("l").await.unwrap(), 3);
        assert_eq!(store.list_range("l", -2, -1).await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.drain_list("l").await.unwrap(), vec!["a", "b", "c"]);
        assert!(!store.exists("l").await.unwrap());
        assert!(store.drain_list("l").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_refreshes_ttl() {
        let store = InMemoryKvStore::new();
        let ttl = Some(Duration::from_secs(10));
        store.push_back("l", "a", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        store.push_back("l", "b", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.list_len("l").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = InMemoryKvStore::new();
        store.set("s", "v", None).await.unwrap();
        assert!(matches!(
            store.push_back("s", "x", None).await,
            Err(MemoryError::WrongType(_))
        ));
        store.push_back("l", "x", None).await.unwrap();
        assert!(store.get("l").await.is_err());
    }

    #[tokio::test]
    async fn test_watch_and_commit_plan_sees_values() {
        let store = InMemoryKvStore::new();
        store.set("a", "1", None).await.unwrap();

        let committed = store
            .watch_and_commit(
                vec!["a".to_string(), "b".to_string()],
                Box::new(|current: &[Option<String>]| {
                    assert_eq!(current, [Some("1".to_string()), None]);
                    Some(vec![KvWrite::set("b", "2"), KvWrite::delete("a")])
                }),
            )
            .await
            .unwrap();
        assert!(committed);
        assert!(!store.exists("a").await.unwrap());
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));

        let aborted = store
            .watch_and_commit(
                vec!["b".to_string()],
                Box::new(|_: &[Option<String>]| None),
            )
            .await
            .unwrap();
        assert!(!aborted);
    }

    #[tokio::test]
    async fn test_scan_keys_by_prefix() {
        let store = InMemoryKvStore::new();
        store.set("audio:u1:a:result", "x", None).await.unwrap();
        store.set("audio:u10:a:result", "x", None).await.unwrap();
        store.push_back("audio:u1:b:buf", "x", None).await.unwrap();
        assert_eq!(
            store.scan_keys("audio:u1:").await.unwrap(),
            vec!["audio:u1:a:result", "audio:u1:b:buf"]
        );
        let removed = store
            .delete(vec!["audio:u1:a:result".into(), "nope".into()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
