//! Proxy lease pool: TTL, empty-pool back-off and single-flight refill
mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::CountingStore;
use crawl_coord::application::{ProxyPoolSettings, RotatingProxyPool};
use crawl_coord::domain::{Clock, MockClock, ProxyEndpoint};
use crawl_coord::infrastructure::CoordinationStore;

const POOL: &str = "proxies_pool";
const NOW: u64 = 1_700_000_000_000;

fn settings(prefetch: usize) -> ProxyPoolSettings {
    ProxyPoolSettings {
        ttl: Duration::from_millis(30_000),
        prefetch,
        empty_wait: Duration::from_millis(5_000),
        escalate_after: 3,
    }
}

fn pool(store: &Arc<CountingStore>, prefetch: usize) -> RotatingProxyPool {
    let clock: Arc<dyn Clock> = Arc::new(MockClock::at_millis(NOW));
    RotatingProxyPool::new(Arc::clone(store) as Arc<dyn CoordinationStore>, POOL, settings(prefetch), clock)
}

#[tokio::test]
async fn expired_leases_are_never_handed_out() {
    let store = Arc::new(CountingStore::default());
    let now = NOW as i64;
    for i in 0..3 {
        store.zadd(POOL, format!("http://stale:{i}").as_bytes(), now - 30_001).await.unwrap();
    }
    store.zadd(POOL, b"http://edge:1", now - 30_000).await.unwrap();
    store.zadd(POOL, b"http://fresh:1", now).await.unwrap();

    let pool = pool(&store, 64);
    assert_eq!(pool.get_lease().await.unwrap().as_str(), "http://edge:1");
    assert_eq!(pool.get_lease().await.unwrap().as_str(), "http://fresh:1");
    assert_eq!(pool.cached(), 0);
    assert_eq!(store.zpopmin_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_pool_backs_off_between_refills() {
    let store = Arc::new(CountingStore::default());
    let pool = pool(&store, 8);

    let publisher = Arc::clone(&store);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2 * 5_000 - 100)).await;
        publisher.zadd(POOL, b"http://late:1", NOW as i64).await.unwrap();
    });

    let started = tokio::time::Instant::now();
    let endpoint = pool.get_lease().await.unwrap();

    assert_eq!(endpoint, ProxyEndpoint::new("http://late:1"));
    assert_eq!(store.zpopmin_calls(), 3);
    assert!(started.elapsed() >= Duration::from_millis(10_000));
}

#[tokio::test]
async fn concurrent_callers_share_one_refill() {
    let store = Arc::new(CountingStore::default());
    let endpoints: Vec<ProxyEndpoint> = (0..20).map(|i| ProxyEndpoint::new(format!("http://p:{i}"))).collect();
    let pool = pool(&store, 64);
    assert_eq!(pool.publish(&endpoints).await.unwrap(), 20);
    assert_eq!(pool.publish(&endpoints[..5]).await.unwrap(), 0);

    let leases = futures::future::join_all((0..20).map(|_| pool.get_lease())).await;
    let distinct: HashSet<String> = leases
        .into_iter()
        .map(|lease| lease.unwrap().as_str().to_string())
        .collect();

    assert_eq!(distinct.len(), 20);
    assert_eq!(store.zpopmin_calls(), 1);
    assert_eq!(store.zcard(POOL).await.unwrap(), 0);
}

#[tokio::test]
async fn refill_is_bounded_by_prefetch() {
    let store = Arc::new(CountingStore::default());
    for i in 0..10 {
        store.zadd(POOL, format!("http://p:{i}").as_bytes(), NOW as i64).await.unwrap();
    }

    let pool = pool(&store, 4);
    pool.get_lease().await.unwrap();
    assert_eq!(pool.cached(), 3);
    assert_eq!(store.zcard(POOL).await.unwrap(), 6);
}
