use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Enumeration of errors for operations against the shared store.
///
/// `Timeout` and `Unavailable` are transient: the caller may retry or fall
/// back. Everything else is permanent for the operation that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found in store")]
    NotFound,
    #[error("store operation timed out")]
    Timeout,
    #[error("parse error: {0}")]
    Parse(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout | StoreError::Unavailable(_))
    }
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StoreError::Timeout
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Capability surface over the shared key/value + list store.
///
/// Every method maps to a single-key operation that is atomic at the store,
/// so callers never need multi-key transactions. Implemented by `RedisStore`
/// for production and `MemoryStore` for tests.
#[async_trait]
pub trait Store: Send + Sync {
    async fn hash_set(&self, key: &str, fields: HashMap<String, String>) -> StoreResult<()>;

    /// An empty hash is indistinguishable from a missing key, so both
    /// surface as `NotFound`.
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    async fn list_push_right(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Blocking left-pop with a timeout. `Ok(None)` means the timeout
    /// elapsed with the list still empty, which is not an error.
    async fn list_block_pop_left(&self, key: &str, timeout: Duration)
        -> StoreResult<Option<String>>;

    async fn list_len(&self, key: &str) -> StoreResult<u64>;

    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    async fn get_string(&self, key: &str) -> StoreResult<String>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>>;

    async fn ping(&self) -> StoreResult<()>;

    /// Result of the most recent `ping`, cached briefly so callers can probe
    /// on the submission hot path without a round-trip per request.
    async fn is_available(&self) -> bool;
}
