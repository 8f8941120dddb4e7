//! In-process coordination store
//!
//! Same semantics as the Redis store with every operation performed under a
//! single lock. Backs the test suites and single-process development runs.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::store::{CoordinationStore, StoreError};

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<Vec<u8>, i64>,
    ordered: BTreeSet<(i64, Vec<u8>)>,
}

impl SortedSet {
    fn insert(&mut self, member: &[u8], score: i64) {
        if let Some(previous) = self.scores.insert(member.to_vec(), score) {
            self.ordered.remove(&(previous, member.to_vec()));
        }
        self.ordered.insert((score, member.to_vec()));
    }

    fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_vec()));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    sets: Mutex<HashMap<String, SortedSet>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &[u8], score: i64) -> Result<(), StoreError> {
        let mut sets = self.sets.lock().await;
        sets.entry(key.to_string()).or_default().insert(member, score);
        Ok(())
    }

    async fn zadd_nx(&self, key: &str, member: &[u8], score: i64) -> Result<bool, StoreError> {
        let mut sets = self.sets.lock().await;
        let set = sets.entry(key.to_string()).or_default();
        if set.scores.contains_key(member) {
            return Ok(false);
        }
        set.insert(member, score);
        Ok(true)
    }

    async fn zscore(&self, key: &str, member: &[u8]) -> Result<Option<i64>, StoreError> {
        let sets = self.sets.lock().await;
        Ok(sets.get(key).and_then(|set| set.scores.get(member).copied()))
    }

    async fn zrem(&self, key: &str, member: &[u8]) -> Result<bool, StoreError> {
        let mut sets = self.sets.lock().await;
        Ok(sets.get_mut(key).is_some_and(|set| set.remove(member)))
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError> {
        let sets = self.sets.lock().await;
        Ok(sets.get(key).map_or(0, |set| {
            set.scores
                .values()
                .filter(|score| (min..=max).contains(*score))
                .count() as u64
        }))
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let sets = self.sets.lock().await;
        Ok(sets.get(key).map_or(0, |set| set.len() as u64))
    }

    async fn zpopmin(&self, key: &str, count: usize) -> Result<Vec<(Vec<u8>, i64)>, StoreError> {
        let mut sets = self.sets.lock().await;
        let Some(set) = sets.get_mut(key) else {
            return Ok(Vec::new());
        };

        let mut popped = Vec::with_capacity(count.min(set.len()));
        while popped.len() < count {
            let Some((score, member)) = set.ordered.pop_first() else {
                break;
            };
            set.scores.remove(&member);
            popped.push((member, score));
        }
        Ok(popped)
    }

    async fn lease(
        &self,
        key: &str,
        now: i64,
        lease_until: i64,
        count: usize,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut sets = self.sets.lock().await;
        let Some(set) = sets.get_mut(key) else {
            return Ok(Vec::new());
        };

        let ready: Vec<Vec<u8>> = set
            .ordered
            .iter()
            .take_while(|(score, _)| *score <= now)
            .take(count)
            .map(|(_, member)| member.clone())
            .collect();

        for member in &ready {
            set.insert(member, lease_until);
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zadd_nx_never_overwrites() {
        let store = MemoryStore::new();
        assert!(store.zadd_nx("k", b"a", 10).await.unwrap());
        assert!(!store.zadd_nx("k", b"a", 99).await.unwrap());
        assert_eq!(store.zscore("k", b"a").await.unwrap(), Some(10));

        store.zadd("k", b"a", 99).await.unwrap();
        assert_eq!(store.zscore("k", b"a").await.unwrap(), Some(99));
        assert_eq!(store.zcard("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn zpopmin_takes_lowest_scores_first() {
        let store = MemoryStore::new();
        store.zadd("pool", b"late", 30).await.unwrap();
        store.zadd("pool", b"early", 10).await.unwrap();
        store.zadd("pool", b"mid", 20).await.unwrap();

        let popped = store.zpopmin("pool", 2).await.unwrap();
        assert_eq!(popped, vec![(b"early".to_vec(), 10), (b"mid".to_vec(), 20)]);
        assert_eq!(store.zcard("pool").await.unwrap(), 1);
        assert!(store.zpopmin("missing", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lease_rescores_only_ready_members() {
        let store = MemoryStore::new();
        store.zadd("q", b"a", 100).await.unwrap();
        store.zadd("q", b"b", 100).await.unwrap();
        store.zadd("q", b"future", 500).await.unwrap();

        let leased = store.lease("q", 100, 20_100, 10).await.unwrap();
        assert_eq!(leased.len(), 2);
        assert!(!leased.contains(&b"future".to_vec()));
        assert_eq!(store.zscore("q", b"a").await.unwrap(), Some(20_100));
        assert_eq!(store.zcount("q", i64::MIN, 100).await.unwrap(), 0);
        assert_eq!(store.zcount("q", i64::MIN, i64::MAX).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn zrem_reports_presence() {
        let store = MemoryStore::new();
        store.zadd("q", b"a", 1).await.unwrap();
        assert!(store.zrem("q", b"a").await.unwrap());
        assert!(!store.zrem("q", b"a").await.unwrap());
        assert!(!store.zrem("other", b"a").await.unwrap());
    }
}
