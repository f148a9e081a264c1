use chrono::{DateTime, Utc};

use crate::mail::{MailboxId, MessageId, UserId};

pub const FLAG_SEEN: &str = "\\Seen";
pub const FLAG_FLAGGED: &str = "\\Flagged";
pub const FLAG_DRAFT: &str = "\\Draft";
pub const FLAG_DELETED: &str = "\\Deleted";
pub const FLAG_ANSWERED: &str = "\\Answered";
pub const FLAG_RECENT: &str = "\\Recent";

/// Compare flags the way IMAP does: system flags (leading backslash) are
/// case-insensitive, keywords are compared verbatim.
pub fn flag_eq(a: &str, b: &str) -> bool {
    if a.starts_with('\\') || b.starts_with('\\') {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// Header fields the engine keeps in structured form. Real MIME parsing
/// lives outside the core; this view is what the indexer hands over.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeaderInfo {
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub date: Option<DateTime<chrono::FixedOffset>>,
    /// All raw header fields, in order of appearance.
    pub raw: Vec<(String, String)>,
}

impl HeaderInfo {
    /// First value of a header field, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.raw
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Address {
    pub name: Option<String>,
    pub email: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub user: UserId,
    pub mailbox: MailboxId,
    /// Unique within the mailbox for its current uid_validity.
    pub uid: u32,
    /// Monotonic across all messages of the user.
    pub modseq: u64,
    pub flags: Vec<String>,
    // mirrors of `flags`, kept in sync by set_flags
    pub unseen: bool,
    pub flagged: bool,
    pub draft: bool,
    pub undeleted: bool,
    /// Internal date: when the message entered the store.
    pub idate: DateTime<Utc>,
    /// Header date, falling back to idate when the header is absent.
    pub hdate: DateTime<Utc>,
    pub size: u32,
    pub thread: String,
    pub headers: HeaderInfo,
    pub text: String,
    pub html: Option<String>,
    /// Blob ids of detached attachments.
    pub attachments: Vec<String>,
}

impl Message {
    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.iter().any(|f| flag_eq(f, name))
    }

    /// Replace the flag set, deduplicate, and refresh the mirror booleans.
    pub fn set_flags(&mut self, flags: Vec<String>) {
        let mut deduped: Vec<String> = Vec::with_capacity(flags.len());
        for flag in flags {
            if !deduped.iter().any(|f| flag_eq(f, &flag)) {
                deduped.push(flag);
            }
        }
        self.flags = deduped;
        self.unseen = !self.has_flag(FLAG_SEEN);
        self.flagged = self.has_flag(FLAG_FLAGGED);
        self.draft = self.has_flag(FLAG_DRAFT);
        self.undeleted = !self.has_flag(FLAG_DELETED);
    }

    pub fn add_flags(&mut self, add: &[String]) {
        let mut flags = self.flags.clone();
        flags.extend(add.iter().cloned());
        self.set_flags(flags);
    }

    pub fn remove_flags(&mut self, remove: &[String]) {
        let flags = self
            .flags
            .iter()
            .filter(|f| !remove.iter().any(|r| flag_eq(f, r)))
            .cloned()
            .collect();
        self.set_flags(flags);
    }
}

/// Split a raw RFC822 message into its header block and body, unfolding
/// continuation lines. This is a header *scan*, not a MIME parser: good
/// enough for the reference store, the envelope view and POP3 TOP.
pub fn scan_headers(source: &[u8]) -> (HeaderInfo, String) {
    let (head, body) = split_head_body(source);

    let mut info = HeaderInfo::default();
    let text = String::from_utf8_lossy(body).into_owned();

    let head_str = String::from_utf8_lossy(head);
    let mut fields: Vec<(String, String)> = Vec::new();
    for line in head_str.lines() {
        if line.is_empty() {
            continue;
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && !fields.is_empty() {
            let last = fields.last_mut().unwrap();
            last.1.push(' ');
            last.1.push_str(line.trim_start());
        } else if let Some((name, value)) = line.split_once(':') {
            fields.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    for (name, value) in fields.iter() {
        match name.to_ascii_lowercase().as_str() {
            "subject" if info.subject.is_none() => info.subject = Some(value.clone()),
            "from" if info.from.is_empty() => info.from = parse_addresses(value),
            "to" if info.to.is_empty() => info.to = parse_addresses(value),
            "cc" if info.cc.is_empty() => info.cc = parse_addresses(value),
            "bcc" if info.bcc.is_empty() => info.bcc = parse_addresses(value),
            "message-id" if info.message_id.is_none() => info.message_id = Some(value.clone()),
            "in-reply-to" if info.in_reply_to.is_none() => info.in_reply_to = Some(value.clone()),
            "date" if info.date.is_none() => {
                info.date = DateTime::parse_from_rfc2822(value).ok();
            }
            _ => (),
        }
    }
    info.raw = fields;

    (info, text)
}

fn split_head_body(source: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = source.windows(4).position(|w| w == b"\r\n\r\n") {
        (&source[..pos + 2], &source[pos + 4..])
    } else if let Some(pos) = source.windows(2).position(|w| w == b"\n\n") {
        (&source[..pos + 1], &source[pos + 2..])
    } else {
        (source, &[])
    }
}

/// Minimal address-list scan: `Name <a@b>, c@d`.
fn parse_addresses(value: &str) -> Vec<Address> {
    value
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            match (part.find('<'), part.find('>')) {
                (Some(open), Some(close)) if open < close => Some(Address {
                    name: match part[..open].trim().trim_matches('"') {
                        "" => None,
                        name => Some(name.to_string()),
                    },
                    email: part[open + 1..close].to_string(),
                }),
                _ => Some(Address {
                    name: None,
                    email: part.to_string(),
                }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_message() -> Message {
        Message {
            id: MessageId::generate(),
            user: "alice".to_string(),
            mailbox: MailboxId::generate(),
            uid: 1,
            modseq: 1,
            flags: vec![],
            unseen: true,
            flagged: false,
            draft: false,
            undeleted: true,
            idate: Utc::now(),
            hdate: Utc::now(),
            size: 0,
            thread: String::new(),
            headers: HeaderInfo::default(),
            text: String::new(),
            html: None,
            attachments: vec![],
        }
    }

    #[test]
    fn booleans_mirror_flags() {
        let mut msg = blank_message();
        msg.set_flags(vec!["\\Seen".to_string(), "\\Flagged".to_string()]);
        assert!(!msg.unseen);
        assert!(msg.flagged);
        assert!(msg.undeleted);

        msg.add_flags(&["\\Deleted".to_string()]);
        assert!(!msg.undeleted);

        msg.remove_flags(&["\\deleted".to_string()]);
        assert!(msg.undeleted);
    }

    #[test]
    fn system_flags_deduplicate_case_insensitively() {
        let mut msg = blank_message();
        msg.set_flags(vec![
            "\\Seen".to_string(),
            "\\SEEN".to_string(),
            "$custom".to_string(),
            "$custom".to_string(),
            "$Custom".to_string(),
        ]);
        assert_eq!(msg.flags, vec!["\\Seen", "$custom", "$Custom"]);
    }

    #[test]
    fn scans_headers_with_continuations() {
        let src = b"Subject: hello\r\n world\r\nFrom: Alice Example <alice@example.tld>\r\nTo: bob@example.tld, Carol <carol@example.tld>\r\nDate: Thu, 12 Oct 2023 08:45:28 +0000\r\n\r\nbody text\r\n";
        let (info, text) = scan_headers(src);
        assert_eq!(info.subject.as_deref(), Some("hello world"));
        assert_eq!(info.from, vec![Address {
            name: Some("Alice Example".to_string()),
            email: "alice@example.tld".to_string(),
        }]);
        assert_eq!(info.to.len(), 2);
        assert_eq!(info.to[1].email, "carol@example.tld");
        assert!(info.date.is_some());
        assert_eq!(text, "body text\r\n");
        assert_eq!(info.get("subject"), Some("hello world"));
    }
}
