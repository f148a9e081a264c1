use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::mail::journal::JournalEntry;
use crate::mail::mailbox::{Mailbox, SpecialUse, HIERARCHY_DELIMITER};
use crate::mail::message::{scan_headers, Message};
use crate::mail::{MailboxId, MessageId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("internal store error")]
    Internal,
}

/// A message about to enter the store. UID, MODSEQ and the parsed views
/// are assigned by the store itself.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub user: String,
    pub mailbox: MailboxId,
    pub flags: Vec<String>,
    pub idate: Option<DateTime<Utc>>,
    pub source: Vec<u8>,
}

#[derive(Clone, Debug)]
pub enum FlagUpdate {
    Add(Vec<String>),
    Remove(Vec<String>),
    Replace(Vec<String>),
}

/// The document-database seam of the server.
///
/// Everything the protocol engines know about mail goes through this
/// trait; [`MemStore`] is the in-memory reference used by tests and the
/// dev server. The journal write path is reserved to the notifier, which
/// is the sole mutator of journals and `modify_index`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Provision the account (INBOX included) if it does not exist yet.
    async fn ensure_user(&self, user: &str) -> Result<(), StoreError>;

    async fn create_mailbox(
        &self,
        user: &str,
        path: &str,
        special_use: SpecialUse,
    ) -> Result<Mailbox, StoreError>;
    async fn mailbox_by_path(&self, user: &str, path: &str)
        -> Result<Option<Mailbox>, StoreError>;
    async fn mailbox_by_id(&self, user: &str, id: MailboxId)
        -> Result<Option<Mailbox>, StoreError>;
    async fn list_mailboxes(&self, user: &str) -> Result<Vec<Mailbox>, StoreError>;
    async fn delete_mailbox(&self, user: &str, id: MailboxId) -> Result<(), StoreError>;
    /// Rename, rewriting the paths of every child mailbox.
    async fn rename_mailbox(
        &self,
        user: &str,
        id: MailboxId,
        new_path: &str,
    ) -> Result<(), StoreError>;
    async fn set_subscribed(
        &self,
        user: &str,
        path: &str,
        subscribed: bool,
    ) -> Result<(), StoreError>;

    /// Append, assigning the next UID of the mailbox and the next MODSEQ
    /// of the user.
    async fn append_message(&self, new: NewMessage) -> Result<Message, StoreError>;
    /// Messages of a mailbox in ascending UID order.
    async fn messages_in(&self, user: &str, mailbox: MailboxId)
        -> Result<Vec<Message>, StoreError>;
    async fn message(&self, user: &str, id: MessageId) -> Result<Option<Message>, StoreError>;
    async fn message_source(&self, user: &str, id: MessageId) -> Result<Vec<u8>, StoreError>;
    /// Apply a flag mutation and return the message with its new MODSEQ.
    async fn update_flags(
        &self,
        user: &str,
        id: MessageId,
        update: FlagUpdate,
    ) -> Result<Message, StoreError>;
    /// Copy into another mailbox under a fresh message id.
    async fn copy_message(
        &self,
        user: &str,
        id: MessageId,
        to: MailboxId,
    ) -> Result<Message, StoreError>;
    /// Move into another mailbox, keeping the message id.
    async fn move_message(
        &self,
        user: &str,
        id: MessageId,
        to: MailboxId,
    ) -> Result<Message, StoreError>;
    /// Remove a message for good and return its final state.
    async fn delete_message(&self, user: &str, id: MessageId) -> Result<Message, StoreError>;

    async fn highest_modseq(&self, user: &str) -> Result<u64, StoreError>;
    /// Per-account state value: `max(modify_index, modseq, 1)`.
    async fn account_state(&self, user: &str) -> Result<u64, StoreError>;

    /// Journal write path. Returns the mailbox's new `modify_index`.
    async fn append_journal(&self, user: &str, entry: JournalEntry) -> Result<u64, StoreError>;
    async fn journal_since(
        &self,
        user: &str,
        mailbox: MailboxId,
        since_modseq: u64,
    ) -> Result<Vec<JournalEntry>, StoreError>;
}

pub type ArcMessageStore = Arc<dyn MessageStore>;

// ---- in-memory reference implementation ----

#[derive(Default)]
struct Account {
    mailboxes: HashMap<MailboxId, Mailbox>,
    messages: HashMap<MessageId, Message>,
    sources: HashMap<MessageId, Vec<u8>>,
    journals: HashMap<MailboxId, BTreeMap<u64, JournalEntry>>,
    modseq: u64,
    uidvalidity_next: u32,
}

impl Account {
    fn next_modseq(&mut self) -> u64 {
        self.modseq += 1;
        self.modseq
    }

    fn mailbox_mut(&mut self, id: MailboxId) -> Result<&mut Mailbox, StoreError> {
        self.mailboxes.get_mut(&id).ok_or(StoreError::NotFound)
    }
}

#[derive(Default)]
pub struct MemStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_account<T>(
        &self,
        user: &str,
        f: impl FnOnce(&mut Account) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut accounts = self.accounts.write().or(Err(StoreError::Internal))?;
        let account = accounts.entry(user.to_string()).or_default();
        if account.mailboxes.is_empty() {
            provision_inbox(user, account);
        }
        f(account)
    }
}

fn provision_inbox(user: &str, account: &mut Account) {
    account.uidvalidity_next += 1;
    let inbox = Mailbox {
        id: MailboxId::generate(),
        user: user.to_string(),
        path: "INBOX".to_string(),
        uid_next: 1,
        uid_validity: account.uidvalidity_next,
        modify_index: 0,
        special_use: SpecialUse::Inbox,
        subscribed: true,
        flags: vec![],
    };
    tracing::debug!(user, mailbox = %inbox.id, "provisioned INBOX");
    account.mailboxes.insert(inbox.id, inbox);
}

fn insert_message(
    account: &mut Account,
    user: &str,
    mailbox: MailboxId,
    flags: Vec<String>,
    idate: Option<DateTime<Utc>>,
    source: Vec<u8>,
    keep_id: Option<MessageId>,
) -> Result<Message, StoreError> {
    let modseq = account.next_modseq();
    let mbx = account.mailbox_mut(mailbox)?;
    let uid = mbx.uid_next;
    mbx.uid_next += 1;

    let (headers, text) = scan_headers(&source);
    let idate = idate.unwrap_or_else(Utc::now);
    let hdate = headers
        .date
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(idate);
    let thread = headers
        .in_reply_to
        .clone()
        .or_else(|| headers.message_id.clone())
        .unwrap_or_default();

    let mut msg = Message {
        id: keep_id.unwrap_or_else(MessageId::generate),
        user: user.to_string(),
        mailbox,
        uid,
        modseq,
        flags: vec![],
        unseen: true,
        flagged: false,
        draft: false,
        undeleted: true,
        idate,
        hdate,
        size: source.len() as u32,
        thread,
        headers,
        text,
        html: None,
        attachments: vec![],
    };
    msg.set_flags(flags);

    account.sources.insert(msg.id, source);
    account.messages.insert(msg.id, msg.clone());
    Ok(msg)
}

#[async_trait]
impl MessageStore for MemStore {
    async fn ensure_user(&self, user: &str) -> Result<(), StoreError> {
        self.with_account(user, |_| Ok(()))
    }

    async fn create_mailbox(
        &self,
        user: &str,
        path: &str,
        special_use: SpecialUse,
    ) -> Result<Mailbox, StoreError> {
        if path.is_empty() || path.starts_with(HIERARCHY_DELIMITER) {
            return Err(StoreError::Invalid(format!("bad mailbox path {:?}", path)));
        }
        self.with_account(user, |account| {
            if account.mailboxes.values().any(|m| m.path == path) {
                return Err(StoreError::AlreadyExists);
            }
            account.uidvalidity_next += 1;
            let mbx = Mailbox {
                id: MailboxId::generate(),
                user: user.to_string(),
                path: path.to_string(),
                uid_next: 1,
                uid_validity: account.uidvalidity_next,
                modify_index: 0,
                special_use,
                subscribed: true,
                flags: vec![],
            };
            account.mailboxes.insert(mbx.id, mbx.clone());
            Ok(mbx)
        })
    }

    async fn mailbox_by_path(
        &self,
        user: &str,
        path: &str,
    ) -> Result<Option<Mailbox>, StoreError> {
        self.with_account(user, |account| {
            Ok(account
                .mailboxes
                .values()
                .find(|m| m.path == path)
                .cloned())
        })
    }

    async fn mailbox_by_id(
        &self,
        user: &str,
        id: MailboxId,
    ) -> Result<Option<Mailbox>, StoreError> {
        self.with_account(user, |account| Ok(account.mailboxes.get(&id).cloned()))
    }

    async fn list_mailboxes(&self, user: &str) -> Result<Vec<Mailbox>, StoreError> {
        self.with_account(user, |account| {
            let mut list: Vec<Mailbox> = account.mailboxes.values().cloned().collect();
            list.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(list)
        })
    }

    async fn delete_mailbox(&self, user: &str, id: MailboxId) -> Result<(), StoreError> {
        self.with_account(user, |account| {
            let mbx = account.mailboxes.remove(&id).ok_or(StoreError::NotFound)?;
            if matches!(mbx.special_use, SpecialUse::Inbox) {
                account.mailboxes.insert(id, mbx);
                return Err(StoreError::Invalid("INBOX can not be deleted".to_string()));
            }
            let doomed: Vec<MessageId> = account
                .messages
                .values()
                .filter(|m| m.mailbox == id)
                .map(|m| m.id)
                .collect();
            for mid in doomed {
                account.messages.remove(&mid);
                account.sources.remove(&mid);
            }
            account.journals.remove(&id);
            Ok(())
        })
    }

    async fn rename_mailbox(
        &self,
        user: &str,
        id: MailboxId,
        new_path: &str,
    ) -> Result<(), StoreError> {
        if new_path.is_empty() {
            return Err(StoreError::Invalid("empty mailbox path".to_string()));
        }
        self.with_account(user, |account| {
            if account.mailboxes.values().any(|m| m.path == new_path) {
                return Err(StoreError::AlreadyExists);
            }
            let old_path = account
                .mailboxes
                .get(&id)
                .ok_or(StoreError::NotFound)?
                .path
                .clone();
            let child_prefix = format!("{}{}", old_path, HIERARCHY_DELIMITER);
            for mbx in account.mailboxes.values_mut() {
                if mbx.id == id {
                    mbx.path = new_path.to_string();
                } else if let Some(tail) = mbx.path.strip_prefix(&child_prefix) {
                    mbx.path = format!("{}{}{}", new_path, HIERARCHY_DELIMITER, tail);
                }
            }
            Ok(())
        })
    }

    async fn set_subscribed(
        &self,
        user: &str,
        path: &str,
        subscribed: bool,
    ) -> Result<(), StoreError> {
        self.with_account(user, |account| {
            let mbx = account
                .mailboxes
                .values_mut()
                .find(|m| m.path == path)
                .ok_or(StoreError::NotFound)?;
            mbx.subscribed = subscribed;
            Ok(())
        })
    }

    async fn append_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let NewMessage {
            user,
            mailbox,
            flags,
            idate,
            source,
        } = new;
        self.with_account(&user, |account| {
            insert_message(account, &user, mailbox, flags, idate, source, None)
        })
    }

    async fn messages_in(
        &self,
        user: &str,
        mailbox: MailboxId,
    ) -> Result<Vec<Message>, StoreError> {
        self.with_account(user, |account| {
            if !account.mailboxes.contains_key(&mailbox) {
                return Err(StoreError::NotFound);
            }
            let mut msgs: Vec<Message> = account
                .messages
                .values()
                .filter(|m| m.mailbox == mailbox)
                .cloned()
                .collect();
            msgs.sort_by_key(|m| m.uid);
            Ok(msgs)
        })
    }

    async fn message(&self, user: &str, id: MessageId) -> Result<Option<Message>, StoreError> {
        self.with_account(user, |account| Ok(account.messages.get(&id).cloned()))
    }

    async fn message_source(&self, user: &str, id: MessageId) -> Result<Vec<u8>, StoreError> {
        self.with_account(user, |account| {
            account.sources.get(&id).cloned().ok_or(StoreError::NotFound)
        })
    }

    async fn update_flags(
        &self,
        user: &str,
        id: MessageId,
        update: FlagUpdate,
    ) -> Result<Message, StoreError> {
        self.with_account(user, |account| {
            let modseq = account.next_modseq();
            let msg = account.messages.get_mut(&id).ok_or(StoreError::NotFound)?;
            match update {
                FlagUpdate::Add(flags) => msg.add_flags(&flags),
                FlagUpdate::Remove(flags) => msg.remove_flags(&flags),
                FlagUpdate::Replace(flags) => msg.set_flags(flags),
            }
            msg.modseq = modseq;
            Ok(msg.clone())
        })
    }

    async fn copy_message(
        &self,
        user: &str,
        id: MessageId,
        to: MailboxId,
    ) -> Result<Message, StoreError> {
        self.with_account(user, |account| {
            let original = account.messages.get(&id).ok_or(StoreError::NotFound)?;
            let flags = original.flags.clone();
            let idate = original.idate;
            let source = account.sources.get(&id).cloned().ok_or(StoreError::NotFound)?;
            insert_message(account, user, to, flags, Some(idate), source, None)
        })
    }

    async fn move_message(
        &self,
        user: &str,
        id: MessageId,
        to: MailboxId,
    ) -> Result<Message, StoreError> {
        self.with_account(user, |account| {
            if !account.mailboxes.contains_key(&to) {
                return Err(StoreError::NotFound);
            }
            let modseq = account.next_modseq();
            let uid = {
                let mbx = account.mailbox_mut(to)?;
                let uid = mbx.uid_next;
                mbx.uid_next += 1;
                uid
            };
            let msg = account.messages.get_mut(&id).ok_or(StoreError::NotFound)?;
            msg.mailbox = to;
            msg.uid = uid;
            msg.modseq = modseq;
            Ok(msg.clone())
        })
    }

    async fn delete_message(&self, user: &str, id: MessageId) -> Result<Message, StoreError> {
        self.with_account(user, |account| {
            let mut msg = account.messages.remove(&id).ok_or(StoreError::NotFound)?;
            account.sources.remove(&id);
            // the deletion itself gets a modseq, carried by the returned
            // message so the journal entry orders after the live history
            msg.modseq = account.next_modseq();
            Ok(msg)
        })
    }

    async fn highest_modseq(&self, user: &str) -> Result<u64, StoreError> {
        self.with_account(user, |account| Ok(account.modseq))
    }

    async fn account_state(&self, user: &str) -> Result<u64, StoreError> {
        self.with_account(user, |account| {
            let max_index = account
                .mailboxes
                .values()
                .map(|m| m.modify_index)
                .max()
                .unwrap_or(0);
            Ok(account.modseq.max(max_index).max(1))
        })
    }

    async fn append_journal(&self, user: &str, entry: JournalEntry) -> Result<u64, StoreError> {
        self.with_account(user, |account| {
            let mbx = account.mailbox_mut(entry.mailbox)?;
            mbx.modify_index = mbx.modify_index.max(entry.modseq);
            let index = mbx.modify_index;
            account
                .journals
                .entry(entry.mailbox)
                .or_default()
                .insert(entry.modseq, entry);
            Ok(index)
        })
    }

    async fn journal_since(
        &self,
        user: &str,
        mailbox: MailboxId,
        since_modseq: u64,
    ) -> Result<Vec<JournalEntry>, StoreError> {
        self.with_account(user, |account| {
            Ok(account
                .journals
                .get(&mailbox)
                .map(|journal| {
                    journal
                        .range((since_modseq + 1)..)
                        .map(|(_, e)| e.clone())
                        .collect()
                })
                .unwrap_or_default())
        })
    }
}
