/*
 * Cross-worker event fan-out.
 *
 * Every worker serving sessions for a user registers itself in the shared
 * cache under `users:{user}` (a sorted set scored by last-seen time) and
 * listens on its own channel `worker:{worker_id}`. Firing an event for a
 * user first evicts stale registrations, then publishes to the channels of
 * the remaining workers. Each worker dispatches incoming events to its
 * local session listeners.
 *
 * The notifier is also the sole mutator of mailbox journals, mailbox
 * modify indexes and the JMAP change log: protocol handlers mutate the
 * message store, then hand the fallout to `publish`.
 */

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{broadcast, watch};

use missive_user::config::NotifierConfig;
use missive_user::storage::{ArcKvStore, KvStore, StorageError};

use crate::changelog::{ChangeKind, ChangeLog};
use crate::mail::journal::JournalEntry;
use crate::mail::store::{ArcMessageStore, MessageStore};

const LOCAL_CHANNEL_CAPACITY: usize = 64;

/// An event as seen by local session listeners.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub user: String,
    pub payload: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct WireEvent {
    e: String,
    #[serde(default)]
    p: Option<serde_json::Value>,
}

fn users_key(user: &str) -> String {
    format!("users:{}", user)
}

fn worker_channel(worker_id: &str) -> String {
    format!("worker:{}", worker_id)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Compact channel message: `{"e":<user>}` with an optional `"p"` payload.
pub fn encode_event(user: &str, payload: Option<&serde_json::Value>) -> Vec<u8> {
    match payload {
        None => format!("{{\"e\":{}}}", serde_json::Value::from(user)).into_bytes(),
        Some(p) => format!(
            "{{\"e\":{},\"p\":{}}}",
            serde_json::Value::from(user),
            p
        )
        .into_bytes(),
    }
}

/// Decode a channel message. Payload-less events are recognized by shape
/// (`{"e":"…"}` with no quote or escape inside the id) and skip the JSON
/// parser entirely.
pub fn decode_event(raw: &[u8]) -> Option<Event> {
    const PREFIX: &[u8] = b"{\"e\":\"";
    const SUFFIX: &[u8] = b"\"}";
    if raw.len() > PREFIX.len() + SUFFIX.len()
        && raw.starts_with(PREFIX)
        && raw.ends_with(SUFFIX)
    {
        let middle = &raw[PREFIX.len()..raw.len() - SUFFIX.len()];
        if !middle.iter().any(|&b| b == b'"' || b == b'\\') {
            return Some(Event {
                user: String::from_utf8_lossy(middle).into_owned(),
                payload: None,
            });
        }
    }
    let wire: WireEvent = serde_json::from_slice(raw).ok()?;
    Some(Event {
        user: wire.e,
        payload: wire.p,
    })
}

pub struct Notifier {
    kv: ArcKvStore,
    store: ArcMessageStore,
    changelog: Arc<ChangeLog>,
    worker_id: String,
    ttl: Duration,
    refresh: Duration,
    local: RwLock<HashMap<String, broadcast::Sender<Event>>>,
}

impl Notifier {
    pub fn new(
        kv: ArcKvStore,
        store: ArcMessageStore,
        changelog: Arc<ChangeLog>,
        config: &NotifierConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            kv,
            store,
            changelog,
            worker_id: config.worker_id.clone(),
            ttl: config.ttl(),
            refresh: config.refresh_period(),
            local: RwLock::new(HashMap::new()),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Register a local listener for a user; the worker advertises itself
    /// in the shared registry so remote workers start routing events here.
    pub async fn subscribe_user(
        &self,
        user: &str,
    ) -> Result<broadcast::Receiver<Event>, StorageError> {
        let receiver = {
            let mut local = self.local.write().or(Err(StorageError::Internal))?;
            local
                .entry(user.to_string())
                .or_insert_with(|| broadcast::channel(LOCAL_CHANNEL_CAPACITY).0)
                .subscribe()
        };
        self.kv
            .zset_add(&users_key(user), &self.worker_id, now_ms())
            .await?;
        Ok(receiver)
    }

    /// Drop the registry entry once the last local listener is gone.
    pub async fn release_user(&self, user: &str) -> Result<(), StorageError> {
        let last_one_out = {
            let mut local = self.local.write().or(Err(StorageError::Internal))?;
            match local.get(user) {
                Some(sender) if sender.receiver_count() == 0 => {
                    local.remove(user);
                    true
                }
                _ => false,
            }
        };
        if last_one_out {
            self.kv
                .zset_remove(&users_key(user), &self.worker_id)
                .await?;
        }
        Ok(())
    }

    /// Record the fallout of a store mutation: journal entries and mailbox
    /// modify-index bumps, change-log appends, then cross-worker fan-out.
    pub async fn publish(
        &self,
        user: &str,
        journal: Vec<JournalEntry>,
        changes: Vec<(ChangeKind, String)>,
    ) -> Result<()> {
        for entry in journal {
            self.store.append_journal(user, entry).await?;
        }
        if !changes.is_empty() {
            self.changelog.append_bulk(user, &changes).await?;
        }
        self.fan_out(user, None).await?;
        Ok(())
    }

    async fn fan_out(
        &self,
        user: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), StorageError> {
        let key = users_key(user);
        let horizon = now_ms() - self.ttl.as_millis() as i64;
        let evicted = self.kv.zset_remove_below(&key, horizon).await?;
        if evicted > 0 {
            tracing::debug!(user, evicted, "evicted stale worker registrations");
        }
        let message = encode_event(user, payload);
        for (worker, _) in self.kv.zset_members(&key).await? {
            self.kv
                .publish(&worker_channel(&worker), message.clone())
                .await?;
        }
        Ok(())
    }

    fn dispatch(&self, raw: Vec<u8>) {
        let event = match decode_event(&raw) {
            Some(event) => event,
            None => {
                tracing::warn!("undecodable notifier event, dropping");
                return;
            }
        };
        let local = match self.local.read() {
            Ok(local) => local,
            Err(_) => return,
        };
        if let Some(sender) = local.get(&event.user) {
            // lagging receivers miss events and resync on next poll
            let _ = sender.send(event);
        }
    }

    async fn refresh_registrations(&self) -> Result<(), StorageError> {
        let users: Vec<String> = {
            let local = self.local.read().or(Err(StorageError::Internal))?;
            local.keys().cloned().collect()
        };
        let now = now_ms();
        for user in users {
            self.kv
                .zset_add(&users_key(&user), &self.worker_id, now)
                .await?;
        }
        Ok(())
    }

    /// Worker loop: drain this worker's channel into local listeners and
    /// refresh registrations every `refresh` period.
    pub async fn run(self: Arc<Self>, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let mut subscription = self.kv.subscribe(&worker_channel(&self.worker_id)).await?;
        let mut refresh = tokio::time::interval(self.refresh);
        tracing::info!(worker_id = %self.worker_id, "notifier worker loop started");
        loop {
            tokio::select! {
                message = subscription.recv() => match message {
                    Some(raw) => self.dispatch(raw),
                    None => break,
                },
                _ = refresh.tick() => {
                    if let Err(e) = self.refresh_registrations().await {
                        tracing::warn!(err = %e, "registration refresh failed");
                    }
                }
                _ = must_exit.changed() => break,
            }
        }
        tracing::info!("notifier worker loop is quitting");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::MemChangeSink;
    use crate::mail::journal::JournalKind;
    use crate::mail::store::{MemStore, MessageStore, NewMessage};
    use crate::mail::MessageId;
    use missive_user::config::ChangelogConfig;
    use missive_user::storage::{KvStore, MemKv};

    fn notifier_on(kv: ArcKvStore, worker_id: &str) -> (Arc<Notifier>, ArcMessageStore) {
        let store: ArcMessageStore = Arc::new(MemStore::new());
        let changelog = ChangeLog::new(
            kv.clone(),
            Arc::new(MemChangeSink::new()),
            &ChangelogConfig::default(),
        );
        let config = NotifierConfig {
            ttl_secs: 120,
            refresh_secs: None,
            worker_id: worker_id.to_string(),
        };
        (
            Notifier::new(kv, store.clone(), changelog, &config),
            store,
        )
    }

    #[test]
    fn event_wire_format_roundtrips() {
        let bare = encode_event("alice", None);
        assert_eq!(bare, b"{\"e\":\"alice\"}".to_vec());
        assert_eq!(
            decode_event(&bare),
            Some(Event {
                user: "alice".to_string(),
                payload: None
            })
        );

        let payload = serde_json::json!({"mailbox": "inbox"});
        let full = encode_event("alice", Some(&payload));
        let event = decode_event(&full).unwrap();
        assert_eq!(event.user, "alice");
        assert_eq!(event.payload, Some(payload));

        // a quote in the id defeats the fast path but not the slow one
        let tricky = encode_event("al\"ice", None);
        assert_eq!(decode_event(&tricky).unwrap().user, "al\"ice");
    }

    #[tokio::test]
    async fn events_reach_every_registered_worker() {
        let kv: ArcKvStore = Arc::new(MemKv::new());
        let (n1, _) = notifier_on(kv.clone(), "w1");
        let (n2, _) = notifier_on(kv.clone(), "w2");

        let (_tx1, exit1) = watch::channel(false);
        let (_tx2, exit2) = watch::channel(false);
        tokio::spawn(n1.clone().run(exit1));
        tokio::spawn(n2.clone().run(exit2));
        tokio::task::yield_now().await;

        let mut rx1 = n1.subscribe_user("alice").await.unwrap();
        let mut rx2 = n2.subscribe_user("alice").await.unwrap();

        n1.publish("alice", vec![], vec![]).await.unwrap();

        let e1 = tokio::time::timeout(Duration::from_secs(1), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        let e2 = tokio::time::timeout(Duration::from_secs(1), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(e1.user, "alice");
        assert_eq!(e2.user, "alice");
    }

    #[tokio::test]
    async fn stale_registrations_are_evicted_on_fire() {
        let kv: ArcKvStore = Arc::new(MemKv::new());
        let (notifier, _) = notifier_on(kv.clone(), "w1");
        notifier.subscribe_user("alice").await.unwrap();

        // a worker that died long ago
        kv.zset_add("users:alice", "dead-worker", now_ms() - 10 * 60 * 1000)
            .await
            .unwrap();

        notifier.publish("alice", vec![], vec![]).await.unwrap();

        let members = kv.zset_members("users:alice").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].0, "w1");
    }

    #[tokio::test]
    async fn release_removes_registration_when_last_listener_drops() {
        let kv: ArcKvStore = Arc::new(MemKv::new());
        let (notifier, _) = notifier_on(kv.clone(), "w1");
        let rx = notifier.subscribe_user("alice").await.unwrap();
        drop(rx);
        notifier.release_user("alice").await.unwrap();
        assert!(kv.zset_members("users:alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_writes_journal_through_the_store() {
        let kv: ArcKvStore = Arc::new(MemKv::new());
        let (notifier, store) = notifier_on(kv, "w1");
        store.ensure_user("alice").await.unwrap();
        let inbox = store
            .mailbox_by_path("alice", "INBOX")
            .await
            .unwrap()
            .unwrap();
        let msg = store
            .append_message(NewMessage {
                user: "alice".to_string(),
                mailbox: inbox.id,
                flags: vec![],
                idate: None,
                source: b"Subject: x\r\n\r\ny\r\n".to_vec(),
            })
            .await
            .unwrap();

        notifier
            .publish(
                "alice",
                vec![JournalEntry::new(
                    inbox.id,
                    msg.modseq,
                    JournalKind::Exists,
                    msg.uid,
                    msg.id,
                    vec![],
                )],
                vec![(ChangeKind::Created, MessageId::to_string(&msg.id))],
            )
            .await
            .unwrap();

        let entries = store.journal_since("alice", inbox.id, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, JournalKind::Exists);
    }
}
