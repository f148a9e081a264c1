use chrono::{DateTime, Utc};

use crate::imap::types::{Flag, StatusItem};

/// Render an IMAP date-time ("01-Jan-2020 10:30:00 +0000").
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%d-%b-%Y %H:%M:%S +0000").to_string()
}

/// ENVELOPE data derived from the stored header view of a message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Address {
    pub name: Option<String>,
    pub mailbox: String,
    pub host: String,
}

/// Untagged response payloads.
#[derive(Clone, Debug, PartialEq)]
pub enum Data {
    Capability(Vec<String>),
    List {
        attributes: Vec<String>,
        delimiter: char,
        name: String,
    },
    Lsub {
        attributes: Vec<String>,
        delimiter: char,
        name: String,
    },
    Status {
        mailbox: String,
        items: Vec<(StatusItem, u64)>,
    },
    Search(Vec<u32>, Option<u64>),
    Flags(Vec<Flag>),
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    Fetch {
        seq: u32,
        items: Vec<FetchedItem>,
    },
    Enabled(Vec<String>),
    Id(Option<Vec<(String, String)>>),
    Namespace,
    Vanished {
        earlier: bool,
        uids: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum FetchedItem {
    Flags(Vec<Flag>),
    Uid(u32),
    InternalDate(DateTime<Utc>),
    Rfc822Size(u32),
    ModSeq(u64),
    Envelope(Envelope),
    Rfc822(Vec<u8>),
    Rfc822Header(Vec<u8>),
    Rfc822Text(Vec<u8>),
    BodySection {
        section_spec: String,
        origin: Option<u32>,
        data: Option<Vec<u8>>,
    },
    /// Minimal single-part structure; real MIME trees live outside the core.
    BodyStructure {
        content_type: (String, String),
        size: u32,
        lines: u32,
    },
}

/// Bracketed response code attached to a status line.
#[derive(Clone, Debug, PartialEq)]
pub enum Code {
    Alert,
    Capability(Vec<String>),
    PermanentFlags(Vec<String>),
    ReadOnly,
    ReadWrite,
    TryCreate,
    UidNext(u32),
    UidValidity(u32),
    Unseen(u32),
    HighestModSeq(u64),
    Modified(String),
    AppendUid(u32, u32),
    CopyUid(u32, String, String),
    CompressionActive,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    Ok,
    No,
    Bad,
    Bye,
    PreAuth,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatusResponse {
    pub tag: Option<String>,
    pub kind: StatusKind,
    pub code: Option<Code>,
    pub text: String,
}

impl StatusResponse {
    pub fn untagged(kind: StatusKind, code: Option<Code>, text: impl Into<String>) -> Self {
        Self {
            tag: None,
            kind,
            code,
            text: text.into(),
        }
    }
}

// ----- encoding -----

/// Encode as quoted string, or as a literal when the payload cannot be
/// represented inside quotes (CR, LF, 8-bit bytes).
fn encode_string(out: &mut Vec<u8>, bytes: &[u8]) {
    let quotable = bytes
        .iter()
        .all(|&b| (0x20..0x7f).contains(&b));
    if quotable {
        out.push(b'"');
        for &b in bytes {
            if b == b'"' || b == b'\\' {
                out.push(b'\\');
            }
            out.push(b);
        }
        out.push(b'"');
    } else {
        encode_literal(out, bytes);
    }
}

fn encode_literal(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(format!("{{{}}}\r\n", bytes.len()).as_bytes());
    out.extend_from_slice(bytes);
}

fn encode_nstring(out: &mut Vec<u8>, value: &Option<String>) {
    match value {
        Some(v) => encode_string(out, v.as_bytes()),
        None => out.extend_from_slice(b"NIL"),
    }
}

fn encode_address_list(out: &mut Vec<u8>, list: &[Address]) {
    if list.is_empty() {
        out.extend_from_slice(b"NIL");
        return;
    }
    out.push(b'(');
    for addr in list {
        out.push(b'(');
        encode_nstring(out, &addr.name);
        out.extend_from_slice(b" NIL ");
        encode_string(out, addr.mailbox.as_bytes());
        out.push(b' ');
        encode_string(out, addr.host.as_bytes());
        out.push(b')');
    }
    out.push(b')');
}

fn encode_envelope(out: &mut Vec<u8>, env: &Envelope) {
    out.push(b'(');
    encode_nstring(out, &env.date);
    out.push(b' ');
    encode_nstring(out, &env.subject);
    out.push(b' ');
    encode_address_list(out, &env.from);
    out.push(b' ');
    // sender and reply-to default to from
    encode_address_list(out, &env.from);
    out.push(b' ');
    encode_address_list(out, &env.from);
    out.push(b' ');
    encode_address_list(out, &env.to);
    out.push(b' ');
    encode_address_list(out, &env.cc);
    out.push(b' ');
    encode_address_list(out, &env.bcc);
    out.push(b' ');
    encode_nstring(out, &env.in_reply_to);
    out.push(b' ');
    encode_nstring(out, &env.message_id);
    out.push(b')');
}

fn encode_fetched_item(out: &mut Vec<u8>, item: &FetchedItem) {
    match item {
        FetchedItem::Flags(flags) => {
            out.extend_from_slice(b"FLAGS (");
            for (i, f) in flags.iter().enumerate() {
                if i > 0 {
                    out.push(b' ');
                }
                out.extend_from_slice(f.to_string().as_bytes());
            }
            out.push(b')');
        }
        FetchedItem::Uid(uid) => out.extend_from_slice(format!("UID {}", uid).as_bytes()),
        FetchedItem::InternalDate(dt) => {
            out.extend_from_slice(format!("INTERNALDATE \"{}\"", format_datetime(dt)).as_bytes())
        }
        FetchedItem::Rfc822Size(size) => {
            out.extend_from_slice(format!("RFC822.SIZE {}", size).as_bytes())
        }
        FetchedItem::ModSeq(modseq) => {
            out.extend_from_slice(format!("MODSEQ ({})", modseq).as_bytes())
        }
        FetchedItem::Envelope(env) => {
            out.extend_from_slice(b"ENVELOPE ");
            encode_envelope(out, env);
        }
        FetchedItem::Rfc822(bytes) => {
            out.extend_from_slice(b"RFC822 ");
            encode_literal(out, bytes);
        }
        FetchedItem::Rfc822Header(bytes) => {
            out.extend_from_slice(b"RFC822.HEADER ");
            encode_literal(out, bytes);
        }
        FetchedItem::Rfc822Text(bytes) => {
            out.extend_from_slice(b"RFC822.TEXT ");
            encode_literal(out, bytes);
        }
        FetchedItem::BodySection {
            section_spec,
            origin,
            data,
        } => {
            out.extend_from_slice(format!("BODY[{}]", section_spec).as_bytes());
            if let Some(origin) = origin {
                out.extend_from_slice(format!("<{}>", origin).as_bytes());
            }
            out.push(b' ');
            match data {
                Some(bytes) => encode_literal(out, bytes),
                None => out.extend_from_slice(b"NIL"),
            }
        }
        FetchedItem::BodyStructure {
            content_type: (main, sub),
            size,
            lines,
        } => {
            out.extend_from_slice(b"BODYSTRUCTURE (");
            encode_string(out, main.to_uppercase().as_bytes());
            out.push(b' ');
            encode_string(out, sub.to_uppercase().as_bytes());
            out.extend_from_slice(
                format!(" (\"CHARSET\" \"utf-8\") NIL NIL \"7BIT\" {} {})", size, lines)
                    .as_bytes(),
            );
        }
    }
}

impl Data {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"* ");
        match self {
            Data::Capability(caps) => {
                out.extend_from_slice(b"CAPABILITY");
                for cap in caps {
                    out.push(b' ');
                    out.extend_from_slice(cap.as_bytes());
                }
            }
            Data::List {
                attributes,
                delimiter,
                name,
            }
            | Data::Lsub {
                attributes,
                delimiter,
                name,
            } => {
                out.extend_from_slice(match self {
                    Data::List { .. } => b"LIST (",
                    _ => b"LSUB (",
                });
                out.extend_from_slice(attributes.join(" ").as_bytes());
                out.extend_from_slice(format!(") \"{}\" ", delimiter).as_bytes());
                encode_string(out, name.as_bytes());
            }
            Data::Status { mailbox, items } => {
                out.extend_from_slice(b"STATUS ");
                encode_string(out, mailbox.as_bytes());
                out.extend_from_slice(b" (");
                for (i, (item, value)) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(b' ');
                    }
                    out.extend_from_slice(format!("{} {}", item, value).as_bytes());
                }
                out.push(b')');
            }
            Data::Search(ids, modseq) => {
                out.extend_from_slice(b"SEARCH");
                for id in ids {
                    out.extend_from_slice(format!(" {}", id).as_bytes());
                }
                if let Some(modseq) = modseq {
                    out.extend_from_slice(format!(" (MODSEQ {})", modseq).as_bytes());
                }
            }
            Data::Flags(flags) => {
                out.extend_from_slice(b"FLAGS (");
                for (i, f) in flags.iter().enumerate() {
                    if i > 0 {
                        out.push(b' ');
                    }
                    out.extend_from_slice(f.to_string().as_bytes());
                }
                out.push(b')');
            }
            Data::Exists(n) => out.extend_from_slice(format!("{} EXISTS", n).as_bytes()),
            Data::Recent(n) => out.extend_from_slice(format!("{} RECENT", n).as_bytes()),
            Data::Expunge(n) => out.extend_from_slice(format!("{} EXPUNGE", n).as_bytes()),
            Data::Fetch { seq, items } => {
                out.extend_from_slice(format!("{} FETCH (", seq).as_bytes());
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(b' ');
                    }
                    encode_fetched_item(out, item);
                }
                out.push(b')');
            }
            Data::Enabled(caps) => {
                out.extend_from_slice(b"ENABLED");
                for cap in caps {
                    out.push(b' ');
                    out.extend_from_slice(cap.as_bytes());
                }
            }
            Data::Id(params) => {
                out.extend_from_slice(b"ID ");
                match params {
                    None => out.extend_from_slice(b"NIL"),
                    Some(params) => {
                        out.push(b'(');
                        for (i, (k, v)) in params.iter().enumerate() {
                            if i > 0 {
                                out.push(b' ');
                            }
                            encode_string(out, k.as_bytes());
                            out.push(b' ');
                            encode_string(out, v.as_bytes());
                        }
                        out.push(b')');
                    }
                }
            }
            Data::Namespace => {
                out.extend_from_slice(b"NAMESPACE ((\"\" \"/\")) NIL NIL");
            }
            Data::Vanished { earlier, uids } => {
                out.extend_from_slice(b"VANISHED ");
                if *earlier {
                    out.extend_from_slice(b"(EARLIER) ");
                }
                out.extend_from_slice(uids.as_bytes());
            }
        }
        out.extend_from_slice(b"\r\n");
    }
}

impl Code {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Code::Alert => out.extend_from_slice(b"ALERT"),
            Code::Capability(caps) => {
                out.extend_from_slice(b"CAPABILITY ");
                out.extend_from_slice(caps.join(" ").as_bytes());
            }
            Code::PermanentFlags(flags) => {
                out.extend_from_slice(format!("PERMANENTFLAGS ({})", flags.join(" ")).as_bytes())
            }
            Code::ReadOnly => out.extend_from_slice(b"READ-ONLY"),
            Code::ReadWrite => out.extend_from_slice(b"READ-WRITE"),
            Code::TryCreate => out.extend_from_slice(b"TRYCREATE"),
            Code::UidNext(n) => out.extend_from_slice(format!("UIDNEXT {}", n).as_bytes()),
            Code::UidValidity(n) => out.extend_from_slice(format!("UIDVALIDITY {}", n).as_bytes()),
            Code::Unseen(n) => out.extend_from_slice(format!("UNSEEN {}", n).as_bytes()),
            Code::HighestModSeq(n) => {
                out.extend_from_slice(format!("HIGHESTMODSEQ {}", n).as_bytes())
            }
            Code::Modified(set) => out.extend_from_slice(format!("MODIFIED {}", set).as_bytes()),
            Code::AppendUid(validity, uid) => {
                out.extend_from_slice(format!("APPENDUID {} {}", validity, uid).as_bytes())
            }
            Code::CopyUid(validity, from, to) => {
                out.extend_from_slice(format!("COPYUID {} {} {}", validity, from, to).as_bytes())
            }
            Code::CompressionActive => out.extend_from_slice(b"COMPRESSIONACTIVE"),
            Code::Closed => out.extend_from_slice(b"CLOSED"),
        }
    }
}

impl StatusResponse {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match &self.tag {
            Some(tag) => out.extend_from_slice(tag.as_bytes()),
            None => out.push(b'*'),
        }
        out.push(b' ');
        out.extend_from_slice(match self.kind {
            StatusKind::Ok => b"OK".as_ref(),
            StatusKind::No => b"NO".as_ref(),
            StatusKind::Bad => b"BAD".as_ref(),
            StatusKind::Bye => b"BYE".as_ref(),
            StatusKind::PreAuth => b"PREAUTH".as_ref(),
        });
        if let Some(code) = &self.code {
            out.extend_from_slice(b" [");
            code.encode(out);
            out.push(b']');
        }
        if !self.text.is_empty() {
            out.push(b' ');
            out.extend_from_slice(self.text.as_bytes());
        }
        out.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_data(data: Data) -> String {
        let mut out = Vec::new();
        data.encode(&mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn encodes_status_line_with_code() {
        let mut out = Vec::new();
        StatusResponse {
            tag: Some("a1".to_string()),
            kind: StatusKind::Ok,
            code: Some(Code::UidValidity(42)),
            text: "SELECT completed".to_string(),
        }
        .encode(&mut out);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "a1 OK [UIDVALIDITY 42] SELECT completed\r\n"
        );
    }

    #[test]
    fn encodes_untagged_fetch_with_flags_and_modseq() {
        let rendered = render_data(Data::Fetch {
            seq: 14,
            items: vec![
                FetchedItem::Uid(1305),
                FetchedItem::Flags(vec![Flag::Seen, Flag::Deleted]),
                FetchedItem::ModSeq(12111230047),
            ],
        });
        assert_eq!(
            rendered,
            "* 14 FETCH (UID 1305 FLAGS (\\Seen \\Deleted) MODSEQ (12111230047))\r\n"
        );
    }

    #[test]
    fn encodes_search_results_with_modseq() {
        let rendered = render_data(Data::Search(vec![2, 5, 6], Some(917162500)));
        assert_eq!(rendered, "* SEARCH 2 5 6 (MODSEQ 917162500)\r\n");
    }

    #[test]
    fn binary_unsafe_strings_become_literals() {
        let mut out = Vec::new();
        encode_string(&mut out, b"two\r\nlines");
        assert_eq!(out, b"{10}\r\ntwo\r\nlines".to_vec());
    }

    #[test]
    fn quotes_are_escaped() {
        let mut out = Vec::new();
        encode_string(&mut out, b"say \"hi\"");
        assert_eq!(out, b"\"say \\\"hi\\\"\"".to_vec());
    }

    #[test]
    fn encodes_list_response() {
        let rendered = render_data(Data::List {
            attributes: vec!["\\HasNoChildren".to_string(), "\\Sent".to_string()],
            delimiter: '/',
            name: "Sent".to_string(),
        });
        assert_eq!(rendered, "* LIST (\\HasNoChildren \\Sent) \"/\" \"Sent\"\r\n");
    }
}
