/*
 * Per-user ordered log of object lifecycle events, backing the JMAP
 * "/changes" methods (RFC 8620 §5.2).
 *
 * The log lives in the shared key-value cache: an atomic counter holds the
 * per-user state, a bounded list holds the most recent entries. A
 * background compaction job spills older entries into a durable sink and
 * trims the cache copy. Bulk append is the primitive; a single append is
 * its n=1 case.
 */

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use missive_user::config::ChangelogConfig;
use missive_user::storage::{with_retries, ArcKvStore, KvStore, KvWrite, StorageError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Destroyed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub id: String,
    pub ts: i64,
}

/// Result of a `changes_since` query, already categorized.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Changes {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub destroyed: Vec<String>,
    pub new_state: u64,
    pub cannot_calculate: bool,
}

/// Durable spillover target of the compaction job. Entries are keyed by
/// `(user, seq)` so re-persisting the same batch is a no-op.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn persist(&self, user: &str, entries: &[ChangeEntry]) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct MemChangeSink {
    entries: RwLock<BTreeMap<(String, u64), ChangeEntry>>,
}

impl MemChangeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries_for(&self, user: &str) -> Vec<ChangeEntry> {
        let entries = self.entries.read().expect("sink lock poisoned");
        entries
            .iter()
            .filter(|((u, _), _)| u == user)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl ChangeSink for MemChangeSink {
    async fn persist(&self, user: &str, batch: &[ChangeEntry]) -> Result<(), StorageError> {
        let mut entries = self.entries.write().or(Err(StorageError::Internal))?;
        for entry in batch {
            entries.insert((user.to_string(), entry.seq), entry.clone());
        }
        Ok(())
    }
}

pub struct ChangeLog {
    kv: ArcKvStore,
    sink: Arc<dyn ChangeSink>,
    max_entries: usize,
    compact_keep: usize,
    /// Users with appends since the last compaction sweep.
    touched: Mutex<HashSet<String>>,
}

fn state_key(user: &str) -> String {
    format!("jmap:state:{}", user)
}

fn log_key(user: &str) -> String {
    format!("jmap:changes:{}", user)
}

impl ChangeLog {
    pub fn new(kv: ArcKvStore, sink: Arc<dyn ChangeSink>, config: &ChangelogConfig) -> Arc<Self> {
        Arc::new(Self {
            kv,
            sink,
            max_entries: config.max_entries,
            compact_keep: config.compact_keep,
            touched: Mutex::new(HashSet::new()),
        })
    }

    /// Append one change; returns its sequence number.
    pub async fn append(
        &self,
        user: &str,
        kind: ChangeKind,
        id: &str,
    ) -> Result<u64, StorageError> {
        let (base, _) = self
            .append_bulk(user, &[(kind, id.to_string())])
            .await?;
        Ok(base)
    }

    /// Append a batch in one reserved, contiguous sequence range
    /// `base..=top`. Two round trips total: one counter bump to reserve
    /// the range, one pipeline for the pushes and the trim.
    pub async fn append_bulk(
        &self,
        user: &str,
        items: &[(ChangeKind, String)],
    ) -> Result<(u64, u64), StorageError> {
        let n = items.len() as u64;
        if n == 0 {
            let state = self.kv.counter_get(&state_key(user)).await?;
            return Ok((state + 1, state));
        }

        let top = {
            let kv = &self.kv;
            let key = state_key(user);
            with_retries(|| kv.counter_incr(&key, n)).await?
        };
        let base = top - n + 1;

        let ts = Utc::now().timestamp_millis();
        let values = items
            .iter()
            .zip(base..=top)
            .map(|((kind, id), seq)| {
                serde_json::to_vec(&ChangeEntry {
                    seq,
                    kind: *kind,
                    id: id.clone(),
                    ts,
                })
                .or(Err(StorageError::Internal))
            })
            .collect::<Result<Vec<_>, _>>()?;

        {
            let kv = &self.kv;
            let key = log_key(user);
            let max_entries = self.max_entries as u64;
            with_retries(|| {
                kv.pipeline(vec![
                    KvWrite::ListPushBack {
                        key: key.clone(),
                        values: values.clone(),
                    },
                    KvWrite::ListTrimToTail {
                        key: key.clone(),
                        max_len: max_entries,
                    },
                ])
            })
            .await?;
        }

        self.touched
            .lock()
            .expect("touched lock poisoned")
            .insert(user.to_string());

        tracing::debug!(user, base, top, "appended changes");
        Ok((base, top))
    }

    /// Categorized changes with `seq > since`. Sets `cannot_calculate`
    /// when the retained window no longer reaches back to `since`.
    pub async fn changes_since(&self, user: &str, since: u64) -> Result<Changes, StorageError> {
        let state = self.kv.counter_get(&state_key(user)).await?;
        let mut result = Changes {
            new_state: state,
            ..Changes::default()
        };

        if since == state {
            return Ok(result);
        }
        if since > state {
            result.cannot_calculate = true;
            return Ok(result);
        }

        let raw = self.kv.list_range(&log_key(user), 0, -1).await?;
        let entries: Vec<ChangeEntry> = raw
            .iter()
            .filter_map(|bytes| match serde_json::from_slice(bytes) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(user, err = %e, "skipping undecodable change entry");
                    None
                }
            })
            .collect();

        match entries.first().map(|e| e.seq) {
            None => {
                result.cannot_calculate = true;
                return Ok(result);
            }
            Some(oldest) if oldest > since + 1 => {
                result.cannot_calculate = true;
                return Ok(result);
            }
            Some(_) => (),
        }

        // Fold multiple events per object: created+destroyed cancels out,
        // created+updated stays created, anything+destroyed is destroyed.
        let mut created: HashMap<&str, bool> = HashMap::new();
        let mut destroyed: HashMap<&str, bool> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();
        for entry in entries.iter().filter(|e| e.seq > since) {
            let id = entry.id.as_str();
            if !created.contains_key(id) && !destroyed.contains_key(id) {
                order.push(id);
            }
            match entry.kind {
                ChangeKind::Created => {
                    created.insert(id, true);
                    destroyed.remove(id);
                }
                ChangeKind::Updated => {
                    created.entry(id).or_insert(false);
                }
                ChangeKind::Destroyed => {
                    destroyed.insert(id, true);
                }
            }
        }
        for id in order {
            let was_created = created.get(id).copied().unwrap_or(false);
            let was_destroyed = destroyed.contains_key(id);
            match (was_created, was_destroyed) {
                (true, true) => (),
                (true, false) => result.created.push(id.to_string()),
                (false, true) => result.destroyed.push(id.to_string()),
                (false, false) => result.updated.push(id.to_string()),
            }
        }
        Ok(result)
    }

    /// Spill everything beyond `compact_keep` into the durable sink, then
    /// trim the cached list. Persist happens before the trim, so a failed
    /// run can simply be repeated: the sink is keyed by sequence number
    /// and re-persisting is a no-op.
    pub async fn compact(&self, user: &str) -> Result<usize, StorageError> {
        let key = log_key(user);
        let len = self.kv.list_len(&key).await?;
        let keep = self.compact_keep as u64;
        if len <= keep {
            return Ok(0);
        }
        let excess = len - keep;
        let raw = self.kv.list_range(&key, 0, excess as i64 - 1).await?;
        let entries: Vec<ChangeEntry> = raw
            .iter()
            .filter_map(|bytes| serde_json::from_slice(bytes).ok())
            .collect();

        self.sink.persist(user, &entries).await?;
        self.kv.list_pop_front(&key, excess).await?;

        tracing::debug!(user, moved = entries.len(), "compacted change log");
        Ok(entries.len())
    }

    /// Periodic compaction of every user touched since the previous sweep.
    pub fn spawn_compactor(
        self: &Arc<Self>,
        period: Duration,
        mut must_exit: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => (),
                    _ = must_exit.changed() => break,
                }
                let users: Vec<String> = {
                    let mut touched = log.touched.lock().expect("touched lock poisoned");
                    touched.drain().collect()
                };
                for user in users {
                    if let Err(e) = log.compact(&user).await {
                        tracing::warn!(user = %user, err = %e, "change log compaction failed");
                    }
                }
            }
            tracing::debug!("compactor is quitting");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use missive_user::storage::MemKv;

    fn changelog_with(
        max_entries: usize,
        compact_keep: usize,
    ) -> (Arc<ChangeLog>, Arc<MemChangeSink>) {
        let kv: ArcKvStore = Arc::new(MemKv::new());
        let sink = Arc::new(MemChangeSink::new());
        let config = ChangelogConfig {
            max_entries,
            compact_keep,
        };
        (ChangeLog::new(kv, sink.clone(), &config), sink)
    }

    #[tokio::test]
    async fn sequences_are_strictly_increasing_per_user() {
        let (log, _) = changelog_with(5000, 1000);
        let mut handles = vec![];
        for task in 0..4 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                let mut seqs = vec![];
                for i in 0..50 {
                    let seq = log
                        .append("alice", ChangeKind::Created, &format!("m{}-{}", task, i))
                        .await
                        .unwrap();
                    seqs.push(seq);
                }
                seqs
            }));
        }
        let mut all: Vec<u64> = vec![];
        for h in handles {
            let seqs = h.await.unwrap();
            // each task observes its own seqs in completion order
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            all.extend(seqs);
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);
    }

    #[tokio::test]
    async fn bulk_append_reserves_a_contiguous_range() {
        let (log, _) = changelog_with(5000, 1000);
        log.append("alice", ChangeKind::Created, "a").await.unwrap();
        let batch: Vec<(ChangeKind, String)> = (0..10)
            .map(|i| (ChangeKind::Updated, format!("m{}", i)))
            .collect();
        let (base, top) = log.append_bulk("alice", &batch).await.unwrap();
        assert_eq!(base, 2);
        assert_eq!(top, 11);

        let changes = log.changes_since("alice", 1).await.unwrap();
        assert_eq!(changes.updated.len(), 10);
        assert_eq!(changes.new_state, 11);
    }

    #[tokio::test]
    async fn categorizes_and_folds_changes() {
        let (log, _) = changelog_with(5000, 1000);
        log.append("alice", ChangeKind::Created, "kept").await.unwrap();
        log.append("alice", ChangeKind::Updated, "kept").await.unwrap();
        log.append("alice", ChangeKind::Created, "ghost").await.unwrap();
        log.append("alice", ChangeKind::Destroyed, "ghost").await.unwrap();
        log.append("alice", ChangeKind::Updated, "old").await.unwrap();
        log.append("alice", ChangeKind::Destroyed, "old").await.unwrap();

        let changes = log.changes_since("alice", 0).await.unwrap();
        assert_eq!(changes.created, vec!["kept"]);
        assert!(changes.updated.is_empty());
        assert_eq!(changes.destroyed, vec!["old"]);
        assert!(!changes.cannot_calculate);
    }

    #[tokio::test]
    async fn trimmed_history_cannot_calculate_changes() {
        let (log, _) = changelog_with(5000, 1000);
        // push the state to 10000; only the last 5000 entries are retained
        let batch: Vec<(ChangeKind, String)> = (0..10_000)
            .map(|i| (ChangeKind::Created, format!("m{}", i)))
            .collect();
        log.append_bulk("alice", &batch).await.unwrap();

        let changes = log.changes_since("alice", 100).await.unwrap();
        assert!(changes.cannot_calculate);
        assert_eq!(changes.new_state, 10_000);

        // a client at the current state sees nothing new
        let changes = log.changes_since("alice", 10_000).await.unwrap();
        assert!(!changes.cannot_calculate);
        assert!(changes.created.is_empty());

        // a client within the retained window still works
        let changes = log.changes_since("alice", 9_000).await.unwrap();
        assert!(!changes.cannot_calculate);
        assert_eq!(changes.created.len(), 1_000);
    }

    #[tokio::test]
    async fn unknown_future_state_cannot_calculate() {
        let (log, _) = changelog_with(5000, 1000);
        log.append("alice", ChangeKind::Created, "a").await.unwrap();
        let changes = log.changes_since("alice", 99).await.unwrap();
        assert!(changes.cannot_calculate);
    }

    #[tokio::test]
    async fn compaction_is_idempotent() {
        let (log, sink) = changelog_with(5000, 10);
        let batch: Vec<(ChangeKind, String)> = (0..25)
            .map(|i| (ChangeKind::Created, format!("m{}", i)))
            .collect();
        log.append_bulk("alice", &batch).await.unwrap();

        let moved = log.compact("alice").await.unwrap();
        assert_eq!(moved, 15);
        let spilled = sink.entries_for("alice");
        assert_eq!(spilled.len(), 15);
        assert_eq!(spilled.first().unwrap().seq, 1);
        assert_eq!(spilled.last().unwrap().seq, 15);

        // no intervening appends: a second run changes nothing
        let moved = log.compact("alice").await.unwrap();
        assert_eq!(moved, 0);
        assert_eq!(sink.entries_for("alice"), spilled);

        // the retained window still answers queries
        let changes = log.changes_since("alice", 15).await.unwrap();
        assert!(!changes.cannot_calculate);
        assert_eq!(changes.created.len(), 10);
    }
}
