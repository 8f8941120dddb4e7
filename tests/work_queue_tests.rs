//! Leased work queue behaviour against the in-memory store

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crawl_coord::application::WorkQueue;
use crawl_coord::domain::{Clock, MockClock, Request};
use crawl_coord::infrastructure::{CoordinationStore, MemoryStore};

const KEY: &str = "requestqueue:news";

fn queue(store: &Arc<MemoryStore>, clock: &Arc<MockClock>) -> WorkQueue {
    WorkQueue::new(
        Arc::clone(store) as Arc<dyn CoordinationStore>,
        KEY,
        Duration::from_millis(20_000),
        Arc::clone(clock) as Arc<dyn Clock>,
    )
}

fn requests(n: usize) -> Vec<Request> {
    (0..n).map(|i| Request::get(format!("https://x.test/page/{i}"))).collect()
}

#[tokio::test]
async fn pop_leases_in_batches() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(MockClock::at_millis(1_000_000));
    let queue = queue(&store, &clock);
    queue.push_many(&requests(3)).await.unwrap();

    let first = queue.pop(2).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(queue.len().await.unwrap(), 1);

    let second = queue.pop(2).await.unwrap();
    assert_eq!(second.len(), 1);
    assert!(queue.pop(2).await.unwrap().is_empty());

    let ids: HashSet<_> = first.iter().chain(&second).map(|l| l.element_id.clone()).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(queue.total_len().await.unwrap(), 3);
}

#[tokio::test]
async fn unacked_elements_come_back_after_the_lease() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(MockClock::at_millis(1_000_000));
    let queue = queue(&store, &clock);
    let pushed = queue.push(&Request::get("https://x.test/crash")).await.unwrap();

    let leased = queue.pop(1).await.unwrap();
    assert_eq!(leased[0].element_id, pushed);
    assert_eq!(leased[0].leased_until_ms, 1_020_000);

    clock.advance(Duration::from_millis(19_999));
    assert!(queue.pop(1).await.unwrap().is_empty());

    clock.advance(Duration::from_millis(1));
    let redelivered = queue.pop(1).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].element_id, pushed);
    assert_eq!(redelivered[0].request.url, "https://x.test/crash");
}

#[tokio::test]
async fn acked_elements_never_come_back() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(MockClock::at_millis(1_000_000));
    let queue = queue(&store, &clock);
    queue.push(&Request::get("https://x.test/done")).await.unwrap();

    let leased = queue.pop(1).await.unwrap();
    assert!(queue.ack(&leased[0].element_id).await.unwrap());

    clock.advance(Duration::from_secs(60));
    assert!(queue.pop(1).await.unwrap().is_empty());
    assert_eq!(queue.total_len().await.unwrap(), 0);
    assert_eq!(queue.metrics().await.acked, 1);
}

#[tokio::test]
async fn concurrent_pops_never_share_an_element() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(MockClock::at_millis(1_000_000));
    let left = queue(&store, &clock);
    let right = queue(&store, &clock);
    left.push_many(&requests(40)).await.unwrap();

    let mut seen = HashSet::new();
    for _ in 0..5 {
        let (a, b) = tokio::join!(left.pop(5), right.pop(5));
        for leased in a.unwrap().into_iter().chain(b.unwrap()) {
            assert!(seen.insert(leased.element_id), "element leased twice");
        }
    }
    assert_eq!(seen.len(), 40);
}

#[tokio::test]
async fn identical_pushes_share_one_element() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(MockClock::at_millis(1_000_000));
    let queue = queue(&store, &clock);
    let request = Request::get("https://x.test/same").with_callback("parse_detail");

    let first = queue.push(&request).await.unwrap();
    let second = queue.push(&request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(queue.total_len().await.unwrap(), 1);
}
