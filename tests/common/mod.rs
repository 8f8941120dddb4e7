//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crawl_coord::application::{ItemSink, SinkError};
use crawl_coord::domain::{CrawledItem, CursorRecord};
use crawl_coord::infrastructure::{CoordinationStore, CursorRepository, MemoryStore, RepositoryError, StoreError};

/// One request seen by [`Responder`]
#[derive(Debug, Clone)]
pub struct Captured {
    /// Path and query, e.g. `/exists?url=...`
    pub target: String,
    pub body: String,
}

/// Minimal HTTP/1.1 server answering every request through `reply`
pub struct Responder {
    pub base_url: String,
    requests: Arc<Mutex<Vec<Captured>>>,
    handle: JoinHandle<()>,
}

impl Responder {
    pub async fn start<F>(reply: F) -> Self
    where
        F: Fn(&Captured) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let reply = Arc::new(reply);

        let captured = Arc::clone(&requests);
        let handle = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let reply = Arc::clone(&reply);
                let captured = Arc::clone(&captured);
                tokio::spawn(async move {
                    let Some(request) = read_request(&mut socket).await else {
                        return;
                    };
                    let (status, body) = reply(&request);
                    captured.lock().unwrap().push(request);

                    let reason = if status == 200 { "OK" } else { "Error" };
                    let response = format!(
                        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            requests,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn requests(&self) -> Vec<Captured> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<Captured> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Some(Captured {
        target: head.split_whitespace().nth(1)?.to_string(),
        body: String::from_utf8_lossy(&buf[header_end..]).to_string(),
    })
}

/// [`MemoryStore`] that counts pop-minimum calls
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemoryStore,
    zpopmin_calls: AtomicUsize,
}

impl CountingStore {
    pub fn zpopmin_calls(&self) -> usize {
        self.zpopmin_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinationStore for CountingStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    async fn zadd(&self, key: &str, member: &[u8], score: i64) -> Result<(), StoreError> {
        self.inner.zadd(key, member, score).await
    }

    async fn zadd_nx(&self, key: &str, member: &[u8], score: i64) -> Result<bool, StoreError> {
        self.inner.zadd_nx(key, member, score).await
    }

    async fn zscore(&self, key: &str, member: &[u8]) -> Result<Option<i64>, StoreError> {
        self.inner.zscore(key, member).await
    }

    async fn zrem(&self, key: &str, member: &[u8]) -> Result<bool, StoreError> {
        self.inner.zrem(key, member).await
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError> {
        self.inner.zcount(key, min, max).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.zcard(key).await
    }

    async fn zpopmin(&self, key: &str, count: usize) -> Result<Vec<(Vec<u8>, i64)>, StoreError> {
        self.zpopmin_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.zpopmin(key, count).await
    }

    async fn lease(&self, key: &str, now: i64, lease_until: i64, count: usize) -> Result<Vec<Vec<u8>>, StoreError> {
        self.inner.lease(key, now, lease_until, count).await
    }
}

/// Store whose every operation fails
#[derive(Default)]
pub struct FailingStore;

fn down<T>() -> Result<T, StoreError> {
    Err(StoreError::Unavailable("connection refused".to_string()))
}

#[async_trait]
impl CoordinationStore for FailingStore {
    async fn ping(&self) -> Result<(), StoreError> {
        down()
    }

    async fn zadd(&self, _key: &str, _member: &[u8], _score: i64) -> Result<(), StoreError> {
        down()
    }

    async fn zadd_nx(&self, _key: &str, _member: &[u8], _score: i64) -> Result<bool, StoreError> {
        down()
    }

    async fn zscore(&self, _key: &str, _member: &[u8]) -> Result<Option<i64>, StoreError> {
        down()
    }

    async fn zrem(&self, _key: &str, _member: &[u8]) -> Result<bool, StoreError> {
        down()
    }

    async fn zcount(&self, _key: &str, _min: i64, _max: i64) -> Result<u64, StoreError> {
        down()
    }

    async fn zcard(&self, _key: &str) -> Result<u64, StoreError> {
        down()
    }

    async fn zpopmin(&self, _key: &str, _count: usize) -> Result<Vec<(Vec<u8>, i64)>, StoreError> {
        down()
    }

    async fn lease(&self, _key: &str, _now: i64, _lease_until: i64, _count: usize) -> Result<Vec<Vec<u8>>, StoreError> {
        down()
    }
}

/// Sink that keeps every delivered item
#[derive(Default)]
pub struct CollectingSink {
    items: Mutex<Vec<CrawledItem>>,
}

impl CollectingSink {
    pub fn items(&self) -> Vec<CrawledItem> {
        self.items.lock().unwrap().clone()
    }
}

#[async_trait]
impl ItemSink for CollectingSink {
    async fn deliver(&self, item: &CrawledItem) -> Result<(), SinkError> {
        self.items.lock().unwrap().push(item.clone());
        Ok(())
    }
}

/// Sink that rejects its first `failures` deliveries
pub struct FlakySink {
    failures: AtomicUsize,
    pub inner: CollectingSink,
}

impl FlakySink {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            inner: CollectingSink::default(),
        }
    }
}

#[async_trait]
impl ItemSink for FlakySink {
    async fn deliver(&self, item: &CrawledItem) -> Result<(), SinkError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SinkError("upload timed out".to_string()));
        }
        self.inner.deliver(item).await
    }
}

/// [`MemoryStore`] whose first `zadd` fails
#[derive(Default)]
pub struct FlakyPushStore {
    pub inner: MemoryStore,
    failed: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl CoordinationStore for FlakyPushStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    async fn zadd(&self, key: &str, member: &[u8], score: i64) -> Result<(), StoreError> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.zadd(key, member, score).await
    }

    async fn zadd_nx(&self, key: &str, member: &[u8], score: i64) -> Result<bool, StoreError> {
        self.inner.zadd_nx(key, member, score).await
    }

    async fn zscore(&self, key: &str, member: &[u8]) -> Result<Option<i64>, StoreError> {
        self.inner.zscore(key, member).await
    }

    async fn zrem(&self, key: &str, member: &[u8]) -> Result<bool, StoreError> {
        self.inner.zrem(key, member).await
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError> {
        self.inner.zcount(key, min, max).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.zcard(key).await
    }

    async fn zpopmin(&self, key: &str, count: usize) -> Result<Vec<(Vec<u8>, i64)>, StoreError> {
        self.inner.zpopmin(key, count).await
    }

    async fn lease(&self, key: &str, now: i64, lease_until: i64, count: usize) -> Result<Vec<Vec<u8>>, StoreError> {
        self.inner.lease(key, now, lease_until, count).await
    }
}

/// In-memory cursor repository that counts writes
#[derive(Default)]
pub struct MemoryCursors {
    records: Mutex<HashMap<(i64, String), CursorRecord>>,
    upserts: AtomicUsize,
}

impl MemoryCursors {
    pub fn with_record(record: CursorRecord) -> Self {
        let cursors = Self::default();
        cursors
            .records
            .lock()
            .unwrap()
            .insert((record.site_id, record.cursor_name.clone()), record);
        cursors
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn value(&self, site_id: i64, cursor_name: &str) -> Option<i64> {
        self.records
            .lock()
            .unwrap()
            .get(&(site_id, cursor_name.to_string()))
            .map(|record| record.cursor_value)
    }
}

#[async_trait]
impl CursorRepository for MemoryCursors {
    async fn load(&self, site_id: i64, cursor_name: &str) -> Result<Option<CursorRecord>, RepositoryError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&(site_id, cursor_name.to_string()))
            .cloned())
    }

    async fn upsert(&self, record: &CursorRecord) -> Result<(), RepositoryError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .unwrap()
            .insert((record.site_id, record.cursor_name.clone()), record.clone());
        Ok(())
    }
}

pub fn cursor_record(site_id: i64, cursor_value: i64) -> CursorRecord {
    CursorRecord {
        site_id,
        cursor_name: "article_id".to_string(),
        cursor_value,
        name: "news".to_string(),
    }
}
