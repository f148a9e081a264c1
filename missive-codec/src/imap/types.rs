use std::fmt;

use chrono::{DateTime, FixedOffset};

use crate::imap::search::SearchKey;
use crate::imap::sequence::SequenceSet;

/// Client-chosen command tag, echoed in the completion status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag(pub String);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A mailbox name as given on the wire. `INBOX` is case-insensitive and is
/// folded to its canonical spelling at construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MailboxName(String);

impl MailboxName {
    pub fn from_wire(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("INBOX") {
            Self("INBOX".to_string())
        } else {
            Self(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MailboxName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// IMAP flag. System flags compare case-insensitively.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Flag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
    Recent,
    Extension(String),
}

impl Flag {
    pub fn from_wire(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "\\SEEN" => Self::Seen,
            "\\ANSWERED" => Self::Answered,
            "\\FLAGGED" => Self::Flagged,
            "\\DELETED" => Self::Deleted,
            "\\DRAFT" => Self::Draft,
            "\\RECENT" => Self::Recent,
            _ => Self::Extension(raw.to_string()),
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seen => write!(f, "\\Seen"),
            Self::Answered => write!(f, "\\Answered"),
            Self::Flagged => write!(f, "\\Flagged"),
            Self::Deleted => write!(f, "\\Deleted"),
            Self::Draft => write!(f, "\\Draft"),
            Self::Recent => write!(f, "\\Recent"),
            Self::Extension(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreAction {
    Add,
    Remove,
    Replace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreResponse {
    Answer,
    Silent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
    HighestModSeq,
}

impl fmt::Display for StatusItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Messages => write!(f, "MESSAGES"),
            Self::Recent => write!(f, "RECENT"),
            Self::UidNext => write!(f, "UIDNEXT"),
            Self::UidValidity => write!(f, "UIDVALIDITY"),
            Self::Unseen => write!(f, "UNSEEN"),
            Self::HighestModSeq => write!(f, "HIGHESTMODSEQ"),
        }
    }
}

/// BODY[] section specifier. Part numbers are not supported: the engine
/// serves whole messages, headers and text only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Section {
    Full,
    Header,
    HeaderFields(Vec<String>),
    HeaderFieldsNot(Vec<String>),
    Text,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchItem {
    Flags,
    Uid,
    InternalDate,
    Rfc822Size,
    Rfc822,
    Rfc822Header,
    Rfc822Text,
    Envelope,
    BodyStructure,
    ModSeq,
    Body {
        section: Section,
        partial: Option<(u32, u32)>,
        peek: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchItems {
    All,
    Fast,
    Full,
    Items(Vec<FetchItem>),
}

impl FetchItems {
    /// Expand the macro forms into their attribute lists.
    pub fn expand(&self) -> Vec<FetchItem> {
        match self {
            Self::Fast => vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
            ],
            Self::All => vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
            ],
            Self::Full => vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
                FetchItem::BodyStructure,
            ],
            Self::Items(items) => items.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub tag: Tag,
    pub body: CommandBody,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommandBody {
    // any state
    Capability,
    Noop,
    Logout,
    Id {
        parameters: Option<Vec<(String, Option<String>)>>,
    },

    // not authenticated
    StartTls,
    Authenticate {
        mechanism: String,
        initial_response: Option<Vec<u8>>,
    },
    Login {
        username: String,
        password: String,
    },

    // authenticated
    Select {
        mailbox: MailboxName,
        condstore: bool,
    },
    Examine {
        mailbox: MailboxName,
        condstore: bool,
    },
    Create {
        mailbox: MailboxName,
    },
    Delete {
        mailbox: MailboxName,
    },
    Rename {
        from: MailboxName,
        to: MailboxName,
    },
    Subscribe {
        mailbox: MailboxName,
    },
    Unsubscribe {
        mailbox: MailboxName,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Status {
        mailbox: MailboxName,
        items: Vec<StatusItem>,
    },
    Append {
        mailbox: MailboxName,
        flags: Vec<Flag>,
        date: Option<DateTime<FixedOffset>>,
        message: Vec<u8>,
    },
    Enable {
        capabilities: Vec<String>,
    },
    Compress {
        algorithm: String,
    },
    Namespace,
    Idle,

    // selected
    Check,
    Close,
    Unselect,
    Expunge {
        uid_sequence_set: Option<SequenceSet>,
    },
    Search {
        criteria: Vec<SearchKey>,
        uid: bool,
    },
    Fetch {
        sequence_set: SequenceSet,
        items: FetchItems,
        changed_since: Option<u64>,
        uid: bool,
    },
    Store {
        sequence_set: SequenceSet,
        action: StoreAction,
        response: StoreResponse,
        flags: Vec<Flag>,
        unchanged_since: Option<u64>,
        uid: bool,
    },
    Copy {
        sequence_set: SequenceSet,
        mailbox: MailboxName,
        uid: bool,
    },
    Move {
        sequence_set: SequenceSet,
        mailbox: MailboxName,
        uid: bool,
    },
}

impl CommandBody {
    /// Short verb name used in traces and error texts.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Capability => "CAPABILITY",
            Self::Noop => "NOOP",
            Self::Logout => "LOGOUT",
            Self::Id { .. } => "ID",
            Self::StartTls => "STARTTLS",
            Self::Authenticate { .. } => "AUTHENTICATE",
            Self::Login { .. } => "LOGIN",
            Self::Select { .. } => "SELECT",
            Self::Examine { .. } => "EXAMINE",
            Self::Create { .. } => "CREATE",
            Self::Delete { .. } => "DELETE",
            Self::Rename { .. } => "RENAME",
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::Unsubscribe { .. } => "UNSUBSCRIBE",
            Self::List { .. } => "LIST",
            Self::Lsub { .. } => "LSUB",
            Self::Status { .. } => "STATUS",
            Self::Append { .. } => "APPEND",
            Self::Enable { .. } => "ENABLE",
            Self::Compress { .. } => "COMPRESS",
            Self::Namespace => "NAMESPACE",
            Self::Idle => "IDLE",
            Self::Check => "CHECK",
            Self::Close => "CLOSE",
            Self::Unselect => "UNSELECT",
            Self::Expunge { .. } => "EXPUNGE",
            Self::Search { .. } => "SEARCH",
            Self::Fetch { .. } => "FETCH",
            Self::Store { .. } => "STORE",
            Self::Copy { .. } => "COPY",
            Self::Move { .. } => "MOVE",
        }
    }
}
