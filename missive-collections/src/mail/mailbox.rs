use serde::{Deserialize, Serialize};

use crate::mail::{MailboxId, UserId};

pub const HIERARCHY_DELIMITER: char = '/';

/// Special-use role of a mailbox (RFC 6154).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialUse {
    #[default]
    None,
    Inbox,
    Sent,
    Drafts,
    Trash,
    Junk,
    Archive,
}

impl SpecialUse {
    /// LIST attribute advertised for this role, if any. INBOX is addressed
    /// by name and carries no attribute.
    pub fn as_attribute(&self) -> Option<&'static str> {
        match self {
            Self::None | Self::Inbox => None,
            Self::Sent => Some("\\Sent"),
            Self::Drafts => Some("\\Drafts"),
            Self::Trash => Some("\\Trash"),
            Self::Junk => Some("\\Junk"),
            Self::Archive => Some("\\Archive"),
        }
    }

    /// JMAP role string.
    pub fn as_role(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Inbox => Some("inbox"),
            Self::Sent => Some("sent"),
            Self::Drafts => Some("drafts"),
            Self::Trash => Some("trash"),
            Self::Junk => Some("junk"),
            Self::Archive => Some("archive"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: MailboxId,
    pub user: UserId,
    /// Hierarchical path, `/`-separated. `INBOX` is the canonical root.
    pub path: String,
    /// Next UID to assign. Strictly greater than every UID ever used here.
    pub uid_next: u32,
    /// Fixed at creation, never changes afterwards.
    pub uid_validity: u32,
    /// Mailbox-scoped monotonic MODSEQ watermark, owned by the notifier.
    pub modify_index: u64,
    pub special_use: SpecialUse,
    pub subscribed: bool,
    /// Flags permitted in this mailbox on top of the system flags.
    pub flags: Vec<String>,
}

impl Mailbox {
    /// Leaf name of the path.
    pub fn name(&self) -> &str {
        self.path
            .rsplit(HIERARCHY_DELIMITER)
            .next()
            .unwrap_or(&self.path)
    }

    /// Parent path, if the mailbox is nested.
    pub fn parent(&self) -> Option<&str> {
        self.path.rsplit_once(HIERARCHY_DELIMITER).map(|(p, _)| p)
    }
}
