use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::storage::*;

const CHANNEL_CAPACITY: usize = 128;

/// In-memory rendition of the shared cache. Single-process only: fine for
/// the dev server and the test suite, useless for a real deployment.
#[derive(Default)]
struct Tables {
    counters: HashMap<String, u64>,
    rows: BTreeMap<String, Vec<u8>>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    zsets: HashMap<String, BTreeMap<String, i64>>,
}

#[derive(Clone, Default)]
pub struct MemKv {
    tables: Arc<RwLock<Tables>>,
    blobs: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock().expect("channel registry poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

fn prefix_last_bound(prefix: &str) -> std::ops::Bound<String> {
    let mut sort_end = prefix.to_string();
    match sort_end.pop() {
        None => Unbounded,
        Some(ch) => {
            let nc = char::from_u32(ch as u32 + 1).unwrap();
            sort_end.push(nc);
            Excluded(sort_end)
        }
    }
}

/// Resolve inclusive list-range bounds where negatives count from the end.
fn range_bounds(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let norm = |i: i64| if i < 0 { len + i } else { i };
    let start = norm(start).max(0);
    let stop = norm(stop).min(len - 1);
    if start > stop || len == 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn apply_write(tables: &mut Tables, write: KvWrite) {
    match write {
        KvWrite::CounterIncr { key, by } => {
            *tables.counters.entry(key).or_insert(0) += by;
        }
        KvWrite::RowPut { key, value } => {
            tables.rows.insert(key, value);
        }
        KvWrite::RowDel { key } => {
            tables.rows.remove(&key);
        }
        KvWrite::ListPushBack { key, values } => {
            tables.lists.entry(key).or_default().extend(values);
        }
        KvWrite::ListTrimToTail { key, max_len } => {
            if let Some(list) = tables.lists.get_mut(&key) {
                while list.len() as u64 > max_len {
                    list.pop_front();
                }
            }
        }
        KvWrite::ZsetAdd { key, member, score } => {
            tables.zsets.entry(key).or_default().insert(member, score);
        }
        KvWrite::ZsetRemove { key, member } => {
            if let Some(set) = tables.zsets.get_mut(&key) {
                set.remove(&member);
            }
        }
        KvWrite::ZsetRemoveBelow { key, score } => {
            if let Some(set) = tables.zsets.get_mut(&key) {
                set.retain(|_, s| *s >= score);
            }
        }
    }
}

#[async_trait]
impl KvStore for MemKv {
    async fn counter_incr(&self, key: &str, by: u64) -> Result<u64, StorageError> {
        tracing::trace!(key, by, command = "counter_incr");
        let mut tables = self.tables.write().or(Err(StorageError::Internal))?;
        let counter = tables.counters.entry(key.to_string()).or_insert(0);
        *counter += by;
        Ok(*counter)
    }

    async fn counter_get(&self, key: &str) -> Result<u64, StorageError> {
        let tables = self.tables.read().or(Err(StorageError::Internal))?;
        Ok(tables.counters.get(key).copied().unwrap_or(0))
    }

    async fn row_get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let tables = self.tables.read().or(Err(StorageError::Internal))?;
        Ok(tables.rows.get(key).cloned())
    }

    async fn row_put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        tracing::trace!(key, command = "row_put");
        let mut tables = self.tables.write().or(Err(StorageError::Internal))?;
        tables.rows.insert(key.to_string(), value);
        Ok(())
    }

    async fn row_del(&self, key: &str) -> Result<(), StorageError> {
        tracing::trace!(key, command = "row_del");
        let mut tables = self.tables.write().or(Err(StorageError::Internal))?;
        tables.rows.remove(key);
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<u64, StorageError> {
        let tables = self.tables.read().or(Err(StorageError::Internal))?;
        Ok(tables.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn list_push_back(&self, key: &str, values: Vec<Vec<u8>>) -> Result<u64, StorageError> {
        tracing::trace!(key, count = values.len(), command = "list_push_back");
        let mut tables = self.tables.write().or(Err(StorageError::Internal))?;
        let list = tables.lists.entry(key.to_string()).or_default();
        list.extend(values);
        Ok(list.len() as u64)
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<Vec<u8>>, StorageError> {
        let tables = self.tables.read().or(Err(StorageError::Internal))?;
        let list = match tables.lists.get(key) {
            Some(l) => l,
            None => return Ok(vec![]),
        };
        match range_bounds(list.len(), start, stop) {
            Some((a, b)) => Ok(list.iter().skip(a).take(b - a + 1).cloned().collect()),
            None => Ok(vec![]),
        }
    }

    async fn list_pop_front(&self, key: &str, count: u64) -> Result<Vec<Vec<u8>>, StorageError> {
        tracing::trace!(key, count, command = "list_pop_front");
        let mut tables = self.tables.write().or(Err(StorageError::Internal))?;
        let list = match tables.lists.get_mut(key) {
            Some(l) => l,
            None => return Ok(vec![]),
        };
        let mut out = Vec::new();
        for _ in 0..count {
            match list.pop_front() {
                Some(v) => out.push(v),
                None => break,
            }
        }
        Ok(out)
    }

    async fn list_trim_to_tail(&self, key: &str, max_len: u64) -> Result<(), StorageError> {
        tracing::trace!(key, max_len, command = "list_trim_to_tail");
        let mut tables = self.tables.write().or(Err(StorageError::Internal))?;
        apply_write(&mut tables, KvWrite::ListTrimToTail {
            key: key.to_string(),
            max_len,
        });
        Ok(())
    }

    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<(), StorageError> {
        tracing::trace!(key, member, score, command = "zset_add");
        let mut tables = self.tables.write().or(Err(StorageError::Internal))?;
        tables
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<(), StorageError> {
        tracing::trace!(key, member, command = "zset_remove");
        let mut tables = self.tables.write().or(Err(StorageError::Internal))?;
        if let Some(set) = tables.zsets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn zset_remove_below(&self, key: &str, score: i64) -> Result<u64, StorageError> {
        let mut tables = self.tables.write().or(Err(StorageError::Internal))?;
        let set = match tables.zsets.get_mut(key) {
            Some(s) => s,
            None => return Ok(0),
        };
        let before = set.len();
        set.retain(|_, s| *s >= score);
        Ok((before - set.len()) as u64)
    }

    async fn zset_members(&self, key: &str) -> Result<Vec<(String, i64)>, StorageError> {
        let tables = self.tables.read().or(Err(StorageError::Internal))?;
        Ok(tables
            .zsets
            .get(key)
            .map(|s| s.iter().map(|(m, v)| (m.clone(), *v)).collect())
            .unwrap_or_default())
    }

    async fn blob_put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        tracing::trace!(key, size = value.len(), command = "blob_put");
        let mut blobs = self.blobs.write().or(Err(StorageError::Internal))?;
        blobs.insert(key.to_string(), value);
        Ok(())
    }

    async fn blob_get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let blobs = self.blobs.read().or(Err(StorageError::Internal))?;
        blobs.get(key).cloned().ok_or(StorageError::NotFound)
    }

    async fn blob_rm(&self, key: &str) -> Result<(), StorageError> {
        tracing::trace!(key, command = "blob_rm");
        let mut blobs = self.blobs.write().or(Err(StorageError::Internal))?;
        blobs.remove(key);
        Ok(())
    }

    async fn blob_list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let blobs = self.blobs.read().or(Err(StorageError::Internal))?;
        let last_bound = prefix_last_bound(prefix);
        Ok(blobs
            .range((Included(prefix.to_string()), last_bound))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn pipeline(&self, writes: Vec<KvWrite>) -> Result<(), StorageError> {
        tracing::trace!(count = writes.len(), command = "pipeline");
        let mut tables = self.tables.write().or(Err(StorageError::Internal))?;
        for write in writes {
            apply_write(&mut tables, write);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize, StorageError> {
        tracing::trace!(channel, size = payload.len(), command = "publish");
        let sender = self.sender_for(channel);
        Ok(sender.send(payload).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<KvSubscription, StorageError> {
        tracing::trace!(channel, command = "subscribe");
        let receiver = self.sender_for(channel).subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(|item| item.ok());
        Ok(KvSubscription::new(Box::pin(stream)))
    }
}
