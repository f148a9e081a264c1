use chrono::{DateTime, Utc};

use crate::mail::{MailboxId, MessageId};

/// What happened to a mailbox, as seen by selected sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalKind {
    /// A message appeared.
    Exists,
    /// A message was removed.
    Expunge,
    /// Flags or metadata of a message changed.
    Fetch,
}

/// One mailbox mutation, ordered by `modseq` within its mailbox.
/// Produced by the notifier, consumed via
/// [`crate::mail::store::MessageStore::journal_since`].
#[derive(Clone, Debug, PartialEq)]
pub struct JournalEntry {
    pub mailbox: MailboxId,
    pub modseq: u64,
    pub kind: JournalKind,
    pub uid: u32,
    pub message: MessageId,
    /// Flag set after the change, for `Fetch` entries.
    pub flags: Vec<String>,
    pub ts: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new(
        mailbox: MailboxId,
        modseq: u64,
        kind: JournalKind,
        uid: u32,
        message: MessageId,
        flags: Vec<String>,
    ) -> Self {
        Self {
            mailbox,
            modseq,
            kind,
            uid,
            message,
            flags,
            ts: Utc::now(),
        }
    }
}
