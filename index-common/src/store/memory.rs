use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{Store, StoreError, StoreResult};

const POP_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct Inner {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    strings: HashMap<String, String>,
    ttls: HashMap<String, Duration>,
    fail_all: bool,
}

/// In-memory `Store` with real hash and list semantics, for tests.
///
/// Unlike a canned-response mock, sequences of operations behave like they
/// would against the real store: a pushed id pops in FIFO order, a deleted
/// hash reads back as `NotFound`. TTLs are recorded for assertions but never
/// enforced; tests simulate expiry by deleting keys. `fail_all` makes every
/// operation (including `ping`) fail, to drive unavailable-store paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every subsequent operation fail as `Unavailable`.
    pub fn fail_all(&self, fail: bool) {
        self.lock().fail_all = fail;
    }

    /// The TTL most recently set on `key`, if any.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.lock().ttls.get(key).copied()
    }

    fn check_available(inner: &Inner) -> StoreResult<()> {
        if inner.fail_all {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hash_set(&self, key: &str, fields: HashMap<String, String>) -> StoreResult<()> {
        let mut inner = self.lock();
        Self::check_available(&inner)?;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .extend(fields);
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        match inner.hashes.get(key) {
            Some(fields) if !fields.is_empty() => Ok(fields.clone()),
            _ => Err(StoreError::NotFound),
        }
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut inner = self.lock();
        Self::check_available(&inner)?;
        let fields = inner.hashes.entry(key.to_string()).or_default();
        let current: i64 = fields
            .get(field)
            .map(|v| v.parse().map_err(|_| StoreError::Parse(v.clone())))
            .transpose()?
            .unwrap_or(0);
        let next = current + delta;
        fields.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn list_push_right(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        Self::check_available(&inner)?;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn list_block_pop_left(
        &self,
        key: &str,
        block_timeout: Duration,
    ) -> StoreResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + block_timeout;
        loop {
            {
                let mut inner = self.lock();
                Self::check_available(&inner)?;
                if let Some(value) = inner.lists.get_mut(key).and_then(VecDeque::pop_front) {
                    return Ok(Some(value));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_INTERVAL).await;
        }
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(inner.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut inner = self.lock();
        Self::check_available(&inner)?;
        inner.strings.insert(key.to_string(), value.to_string());
        if let Some(ttl) = ttl {
            inner.ttls.insert(key.to_string(), ttl);
        }
        Ok(())
    }

    async fn get_string(&self, key: &str) -> StoreResult<String> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        inner
            .strings
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut inner = self.lock();
        Self::check_available(&inner)?;
        inner.ttls.insert(key.to_string(), ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        Self::check_available(&inner)?;
        inner.hashes.remove(key);
        inner.lists.remove(key);
        inner.strings.remove(key);
        inner.ttls.remove(key);
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        // only prefix patterns ("job:*") are used by the queue layer
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let mut keys: Vec<String> = inner
            .hashes
            .keys()
            .chain(inner.strings.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(())
    }

    async fn is_available(&self) -> bool {
        self.ping().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_pop_in_fifo_order() {
        let store = MemoryStore::new();
        store.list_push_right("q", "a").await.unwrap();
        store.list_push_right("q", "b").await.unwrap();

        assert_eq!(store.list_len("q").await.unwrap(), 2);
        assert_eq!(
            store
                .list_block_pop_left("q", Duration::from_millis(10))
                .await
                .unwrap(),
            Some("a".to_string())
        );
        assert_eq!(
            store
                .list_block_pop_left("q", Duration::from_millis(10))
                .await
                .unwrap(),
            Some("b".to_string())
        );
        assert_eq!(
            store
                .list_block_pop_left("q", Duration::from_millis(10))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn hash_roundtrip_and_delete() {
        let store = MemoryStore::new();
        let fields = HashMap::from([("status".to_string(), "queued".to_string())]);
        store.hash_set("job:1", fields.clone()).await.unwrap();

        assert_eq!(store.hash_get_all("job:1").await.unwrap(), fields);

        store.delete("job:1").await.unwrap();
        assert_eq!(
            store.hash_get_all("job:1").await.unwrap_err(),
            StoreError::NotFound
        );
    }

    #[tokio::test]
    async fn hash_incr_starts_at_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.hash_incr_by("job:1", "retry_count", 1).await.unwrap(), 1);
        assert_eq!(store.hash_incr_by("job:1", "retry_count", 1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn scan_matches_prefix() {
        let store = MemoryStore::new();
        store
            .hash_set("job:1", HashMap::from([("a".to_string(), "b".to_string())]))
            .await
            .unwrap();
        store.set_string("worker:w1", "{}", None).await.unwrap();

        assert_eq!(store.scan("job:*").await.unwrap(), vec!["job:1"]);
        assert_eq!(store.scan("worker:*").await.unwrap(), vec!["worker:w1"]);
    }

    #[tokio::test]
    async fn fail_all_makes_everything_unavailable() {
        let store = MemoryStore::new();
        store.fail_all(true);

        assert!(!store.is_available().await);
        assert!(matches!(
            store.list_push_right("q", "a").await,
            Err(StoreError::Unavailable(_))
        ));

        store.fail_all(false);
        assert!(store.is_available().await);
    }
}
