//! Round reporting to the remote log service
//!
//! - `NoLog`: remote logging disabled
//! - `Section`: periodic totals of scheduled requests and delivered items
//! - `Increment`: one record per delivered incremental item
//!
//! Reports are form posts; a report counts as accepted only on HTTP 200 with
//! a JSON body whose `code` is 0. Failures are logged and never propagate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Local;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use super::config::{LogType, ReporterConfig, SourceConfig};
use crate::domain::CrawledItem;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Report request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Report endpoint answered HTTP {0}")]
    Status(StatusCode),

    #[error("Report rejected with code {0}")]
    Rejected(i64),

    #[error("Invalid report endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("{0:?} reporting requires a log_url")]
    MissingEndpoint(LogType),
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn new_log_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn timestamp() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

#[derive(Debug, Deserialize)]
struct LogReply {
    code: i64,
}

#[derive(Debug, Serialize)]
struct SectionLog<'a> {
    #[serde(rename = "LogID")]
    log_id: &'a str,
    #[serde(rename = "SiteID")]
    site_id: i64,
    #[serde(rename = "TotalCount")]
    total_count: u64,
    #[serde(rename = "AddCount")]
    add_count: u64,
    #[serde(rename = "Message")]
    message: &'a str,
    #[serde(rename = "CreateTime")]
    create_time: &'a str,
    #[serde(rename = "ClientID")]
    client_id: &'a str,
}

#[derive(Debug, Serialize)]
struct IncrementLog<'a> {
    #[serde(rename = "LogID")]
    log_id: &'a str,
    #[serde(rename = "SiteID")]
    site_id: i64,
    #[serde(rename = "PlusNum")]
    plus_num: i64,
    #[serde(rename = "PublishTime")]
    publish_time: String,
    #[serde(rename = "CreateTime")]
    create_time: &'a str,
    #[serde(rename = "ClientID")]
    client_id: &'a str,
}

#[derive(Debug, Clone)]
struct LogClient {
    http: reqwest::Client,
    log_url: Url,
    site_id: i64,
    client_id: String,
}

impl LogClient {
    fn new(config: &ReporterConfig, source: &SourceConfig) -> Result<Self, ReportError> {
        let log_url = config
            .log_url
            .as_deref()
            .ok_or(ReportError::MissingEndpoint(config.log_type))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            log_url: Url::parse(log_url)?,
            site_id: source.site_id,
            client_id: source.client_id.clone(),
        })
    }

    async fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), ReportError> {
        let response = self.http.post(self.log_url.clone()).form(payload).send().await?;
        if response.status() != StatusCode::OK {
            return Err(ReportError::Status(response.status()));
        }
        let reply: LogReply = response.json().await?;
        if reply.code == 0 {
            Ok(())
        } else {
            Err(ReportError::Rejected(reply.code))
        }
    }
}

#[derive(Debug, Default)]
struct SectionCounters {
    total: AtomicU64,
    added: AtomicU64,
}

/// Periodic section totals
pub struct SectionReporter {
    client: LogClient,
    interval: Duration,
    counters: Arc<SectionCounters>,
    shutdown: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SectionReporter {
    fn new(client: LogClient, interval: Duration) -> Self {
        Self {
            client,
            interval,
            counters: Arc::new(SectionCounters::default()),
            shutdown: CancellationToken::new(),
            timer: Mutex::new(None),
        }
    }

    /// Unreported `(scheduled requests, delivered items)`
    #[must_use]
    pub fn pending(&self) -> (u64, u64) {
        (
            self.counters.total.load(Ordering::Relaxed),
            self.counters.added.load(Ordering::Relaxed),
        )
    }

    fn open(&self) {
        let client = self.client.clone();
        let counters = Arc::clone(&self.counters);
        let shutdown = self.shutdown.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        flush_section(&client, &counters).await;
                    }
                }
            }
        });

        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("📊 Section reporting every {:?}", self.interval);
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(timer) = timer {
            join_flush_task(timer).await;
        }
        flush_section(&self.client, &self.counters).await;
    }
}

/// Waits for the periodic flush task; `false` when it panicked or was aborted
async fn join_flush_task(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!("Section flush task ended abnormally: {}", e);
            false
        }
    }
}

async fn flush_section(client: &LogClient, counters: &SectionCounters) -> bool {
    let total = counters.total.load(Ordering::Relaxed);
    let added = counters.added.load(Ordering::Relaxed);
    let log_id = new_log_id();
    let create_time = timestamp();
    let payload = SectionLog {
        log_id: &log_id,
        site_id: client.site_id,
        total_count: total,
        add_count: added,
        message: "crawl-coord",
        create_time: &create_time,
        client_id: &client.client_id,
    };

    match client.send(&payload).await {
        Ok(()) => {
            counters.total.fetch_sub(total, Ordering::Relaxed);
            counters.added.fetch_sub(added, Ordering::Relaxed);
            info!("[{}] section log sent: items={} requests={}", client.client_id, added, total);
            true
        }
        Err(e) => {
            warn!("[{}] section log failed ({}): items={} requests={}", client.client_id, e, added, total);
            false
        }
    }
}

/// Per-item incremental records
pub struct IncrementReporter {
    client: LogClient,
    sent: AtomicU64,
}

impl IncrementReporter {
    /// Records accepted by the endpoint so far
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    async fn item_delivered(&self, item: &CrawledItem) {
        let Some(plus_num) = item.increment_id else {
            return;
        };
        let log_id = new_log_id();
        let create_time = timestamp();
        let payload = IncrementLog {
            log_id: &log_id,
            site_id: self.client.site_id,
            plus_num,
            publish_time: item
                .publish_time
                .map(|time| time.format(TIME_FORMAT).to_string())
                .unwrap_or_default(),
            create_time: &create_time,
            client_id: &self.client.client_id,
        };

        match self.client.send(&payload).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("[{}] increment log failed for {}: {}", self.client.client_id, plus_num, e),
        }
    }
}

/// Reporter variant chosen by [`LogType`]
pub enum RoundReporter {
    NoLog,
    Section(SectionReporter),
    Increment(IncrementReporter),
}

impl RoundReporter {
    pub fn from_config(config: &ReporterConfig, source: &SourceConfig) -> Result<Self, ReportError> {
        match config.log_type {
            LogType::NoLog => Ok(Self::NoLog),
            LogType::Section => Ok(Self::Section(SectionReporter::new(
                LogClient::new(config, source)?,
                Duration::from_secs(config.interval_secs.max(1)),
            ))),
            LogType::Increment => Ok(Self::Increment(IncrementReporter {
                client: LogClient::new(config, source)?,
                sent: AtomicU64::new(0),
            })),
        }
    }

    /// Starts background reporting; must run inside a tokio runtime
    pub fn open(&self) {
        match self {
            Self::NoLog => info!("Remote round logging disabled"),
            Self::Section(reporter) => reporter.open(),
            Self::Increment(_) => info!("📊 Increment reporting enabled"),
        }
    }

    pub fn request_scheduled(&self) {
        if let Self::Section(reporter) = self {
            reporter.counters.total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn item_delivered(&self, item: &CrawledItem) {
        match self {
            Self::NoLog => {}
            Self::Section(reporter) => {
                reporter.counters.added.fetch_add(1, Ordering::Relaxed);
            }
            Self::Increment(reporter) => reporter.item_delivered(item).await,
        }
    }

    /// Stops the timer and flushes what is left
    pub async fn close(&self) {
        match self {
            Self::NoLog => info!("Remote round logging disabled, nothing to upload"),
            Self::Section(reporter) => reporter.close().await,
            Self::Increment(reporter) => info!("📊 Increment reporting closed after {} records", reporter.sent()),
        }
    }
}
