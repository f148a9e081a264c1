/*
 * The shared key-value cache every worker talks to.
 *
 * The core only needs a handful of primitives: atomic counters, bounded
 * lists, score-sorted sets, opaque rows and blobs, pub/sub channels, and a
 * pipeline to batch related writes into one logical round trip. The trait
 * is written so that both the in-memory implementation (tests, dev mode)
 * and a networked cache can sit behind it.
 */

pub mod in_memory;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::{Stream, StreamExt};

pub use in_memory::MemKv;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Entry not found")]
    NotFound,
    #[error("Internal storage error")]
    Internal,
}

/// One mutation inside a [`KvStore::pipeline`] batch.
#[derive(Debug, Clone)]
pub enum KvWrite {
    CounterIncr { key: String, by: u64 },
    RowPut { key: String, value: Vec<u8> },
    RowDel { key: String },
    ListPushBack { key: String, values: Vec<Vec<u8>> },
    ListTrimToTail { key: String, max_len: u64 },
    ZsetAdd { key: String, member: String, score: i64 },
    ZsetRemove { key: String, member: String },
    ZsetRemoveBelow { key: String, score: i64 },
}

/// A live subscription to a pub/sub channel.
pub struct KvSubscription {
    stream: Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>,
}

impl KvSubscription {
    pub fn new(stream: Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>) -> Self {
        Self { stream }
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.stream.next().await
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    // counters
    async fn counter_incr(&self, key: &str, by: u64) -> Result<u64, StorageError>;
    async fn counter_get(&self, key: &str) -> Result<u64, StorageError>;

    // opaque rows
    async fn row_get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn row_put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    async fn row_del(&self, key: &str) -> Result<(), StorageError>;

    // bounded lists
    async fn list_len(&self, key: &str) -> Result<u64, StorageError>;
    async fn list_push_back(&self, key: &str, values: Vec<Vec<u8>>) -> Result<u64, StorageError>;
    /// Range with inclusive bounds; negative indices count from the tail.
    async fn list_range(&self, key: &str, start: i64, stop: i64)
        -> Result<Vec<Vec<u8>>, StorageError>;
    async fn list_pop_front(&self, key: &str, count: u64) -> Result<Vec<Vec<u8>>, StorageError>;
    async fn list_trim_to_tail(&self, key: &str, max_len: u64) -> Result<(), StorageError>;

    // sorted sets
    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<(), StorageError>;
    async fn zset_remove(&self, key: &str, member: &str) -> Result<(), StorageError>;
    async fn zset_remove_below(&self, key: &str, score: i64) -> Result<u64, StorageError>;
    async fn zset_members(&self, key: &str) -> Result<Vec<(String, i64)>, StorageError>;

    // blobs
    async fn blob_put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    async fn blob_get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    async fn blob_rm(&self, key: &str) -> Result<(), StorageError>;
    async fn blob_list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Apply all writes as one batch. The batch is atomic with respect to
    /// other callers of the same store.
    async fn pipeline(&self, writes: Vec<KvWrite>) -> Result<(), StorageError>;

    // pub/sub
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, StorageError>;
    async fn subscribe(&self, channel: &str) -> Result<KvSubscription, StorageError>;
}

pub type ArcKvStore = Arc<dyn KvStore>;

/// Retry a transient-failure-prone operation with exponential backoff.
/// `NotFound` is not transient and aborts immediately.
pub async fn with_retries<T, F, Fut>(mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    const ATTEMPTS: u32 = 3;
    let mut delay = Duration::from_millis(10);
    let mut last = StorageError::Internal;
    for attempt in 1..=ATTEMPTS {
        match op().await {
            Ok(v) => return Ok(v),
            Err(StorageError::NotFound) => return Err(StorageError::NotFound),
            Err(e) => {
                tracing::warn!(attempt, err = %e, "kv operation failed, will retry");
                last = e;
                if attempt < ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(last)
}
