//! Infrastructure layer for the shared store, cursor storage and external services
//!
//! This module provides the coordination store backends, cursor persistence,
//! the remote dedup authority, round reporting, configuration and logging.

pub mod config;             // Layered configuration
pub mod cursor_repository;  // Cursor records over sqlx
pub mod logging;            // Logging infrastructure
pub mod memory_store;       // In-process store for tests and local runs
pub mod redis_store;        // Redis-backed shared store
pub mod remote_authority;   // Tier-3 dedup lookup
pub mod round_reporter;     // Remote round logs
pub mod store;              // Sorted-set store contract

pub use config::{AppConfig, ConfigManager, Locale, LogType, LoggingConfig, ProxyMode};
pub use cursor_repository::{CursorRepository, RepositoryError, SqlCursorRepository};
pub use logging::{get_log_directory, init_logging, init_logging_with_config};
pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use remote_authority::{HttpAuthority, RemoteAuthority, RemoteError};
pub use round_reporter::{ReportError, RoundReporter};
pub use store::{CoordinationStore, KeySpace, StoreError};
