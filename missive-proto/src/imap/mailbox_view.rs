use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;

use missive_codec::imap::response::{
    Address as CodecAddress, Code, Data, Envelope, FetchedItem, StatusKind, StatusResponse,
};
use missive_codec::imap::search::SearchKey;
use missive_codec::imap::sequence::SequenceSet;
use missive_codec::imap::types::{FetchItem, FetchItems, Flag, Section, StoreAction, StoreResponse};
use missive_collections::changelog::ChangeKind;
use missive_collections::mail::journal::{JournalEntry, JournalKind};
use missive_collections::mail::mailbox::Mailbox;
use missive_collections::mail::message::{HeaderInfo, Message, FLAG_DELETED, FLAG_RECENT, FLAG_SEEN};
use missive_collections::mail::store::{ArcMessageStore, FlagUpdate, MessageStore};
use missive_collections::mail::MessageId;
use missive_collections::notifier::Notifier;

use crate::imap::index::Index;
use crate::imap::response::Body;
use crate::imap::search::{Criteria, SearchContext};

const DEFAULT_FLAGS: [&str; 5] = [
    "\\Seen",
    "\\Answered",
    "\\Flagged",
    "\\Deleted",
    "\\Draft",
];

pub struct UpdateParameters {
    pub silence: HashSet<MessageId>,
    pub with_modseq: bool,
    pub with_uid: bool,
}

impl Default for UpdateParameters {
    fn default() -> Self {
        Self {
            silence: HashSet::new(),
            with_modseq: false,
            with_uid: false,
        }
    }
}

/// What the client already knows about one message.
struct KnownMail {
    id: MessageId,
    uid: u32,
    flags: Vec<String>,
}

/// A MailboxView is responsible for giving the client the information it
/// needs about a mailbox: the initial summary sent on SELECT, and the
/// continuous untagged updates describing how the mailbox changed since.
/// It tracks `known`, the state the client has been told about, and a
/// journal watermark; `update` turns journal entries past the watermark
/// into properly ordered EXPUNGE/FETCH/EXISTS lines.
pub struct MailboxView {
    store: ArcMessageStore,
    notifier: Arc<Notifier>,
    user: String,
    pub mailbox: Mailbox,
    known: Vec<KnownMail>,
    seen_modseq: u64,
    pub is_condstore: bool,
}

impl MailboxView {
    pub async fn open(
        store: ArcMessageStore,
        notifier: Arc<Notifier>,
        user: &str,
        mailbox: Mailbox,
        is_condstore: bool,
    ) -> Result<Self> {
        let messages = store.messages_in(user, mailbox.id).await?;
        let seen_modseq = messages
            .iter()
            .map(|m| m.modseq)
            .max()
            .unwrap_or(0)
            .max(mailbox.modify_index);
        let known = messages
            .iter()
            .map(|m| KnownMail {
                id: m.id,
                uid: m.uid,
                flags: m.flags.clone(),
            })
            .collect();
        Ok(Self {
            store,
            notifier,
            user: user.to_string(),
            mailbox,
            known,
            seen_modseq,
            is_condstore,
        })
    }

    pub fn exists(&self) -> u32 {
        self.known.len() as u32
    }

    pub fn highestmodseq(&self) -> u64 {
        self.seen_modseq.max(1)
    }

    fn recent(&self) -> u32 {
        self.known
            .iter()
            .filter(|k| k.flags.iter().any(|f| f.eq_ignore_ascii_case(FLAG_RECENT)))
            .count() as u32
    }

    /// The SELECT/EXAMINE summary: what the client needs to know before
    /// issuing its first command against the mailbox.
    pub fn summary(&self) -> Vec<Body> {
        let mut data = Vec::new();
        data.push(Body::Data(Data::Exists(self.exists())));
        data.push(Body::Data(Data::Recent(self.recent())));
        data.extend(self.flags_status());
        data.push(Body::Status(StatusResponse::untagged(
            StatusKind::Ok,
            Some(Code::UidValidity(self.mailbox.uid_validity)),
            "UIDs valid",
        )));
        data.push(Body::Status(StatusResponse::untagged(
            StatusKind::Ok,
            Some(Code::UidNext(self.mailbox.uid_next)),
            "Predicted next UID",
        )));
        if self.is_condstore {
            data.push(Body::Status(StatusResponse::untagged(
                StatusKind::Ok,
                Some(Code::HighestModSeq(self.highestmodseq())),
                "Highest",
            )));
        }
        data
    }

    fn flags_status(&self) -> Vec<Body> {
        let mut known_flags: Vec<Flag> = Vec::new();
        for known in &self.known {
            for flag in &known.flags {
                let parsed = Flag::from_wire(flag);
                if !known_flags.contains(&parsed) {
                    known_flags.push(parsed);
                }
            }
        }
        for default in DEFAULT_FLAGS {
            let parsed = Flag::from_wire(default);
            if !known_flags.contains(&parsed) {
                known_flags.push(parsed);
            }
        }

        let mut permanent: Vec<String> = DEFAULT_FLAGS.iter().map(|f| f.to_string()).collect();
        permanent.push("\\*".to_string());

        vec![
            Body::Data(Data::Flags(known_flags)),
            Body::Status(StatusResponse::untagged(
                StatusKind::Ok,
                Some(Code::PermanentFlags(permanent)),
                "Flags permitted",
            )),
        ]
    }

    /// Turn journal entries past the client's watermark into untagged
    /// responses, in journal order so sequence numbers stay correct:
    ///
    /// ```text
    /// C: a047 NOOP
    /// S: * 22 EXPUNGE
    /// S: * 23 EXISTS
    /// S: * 14 FETCH (FLAGS (\Seen \Deleted))
    /// S: a047 OK NOOP completed
    /// ```
    pub async fn update(&mut self, params: UpdateParameters) -> Result<Vec<Body>> {
        let entries = self
            .store
            .journal_since(&self.user, self.mailbox.id, self.seen_modseq)
            .await?;
        if entries.is_empty() {
            return Ok(vec![]);
        }

        let mut data = Vec::new();
        let mut new_arrivals = false;
        for entry in &entries {
            self.seen_modseq = self.seen_modseq.max(entry.modseq);
            match entry.kind {
                JournalKind::Expunge => {
                    if let Some(pos) = self.known.iter().position(|k| k.id == entry.message) {
                        self.known.remove(pos);
                        data.push(Body::Data(Data::Expunge((pos + 1) as u32)));
                    }
                }
                JournalKind::Fetch => {
                    if let Some(pos) = self.known.iter().position(|k| k.id == entry.message) {
                        self.known[pos].flags = entry.flags.clone();
                        if !params.silence.contains(&entry.message) {
                            let mut items = vec![FetchedItem::Flags(
                                entry.flags.iter().map(|f| Flag::from_wire(f)).collect(),
                            )];
                            if params.with_uid {
                                items.push(FetchedItem::Uid(entry.uid));
                            }
                            if params.with_modseq {
                                items.push(FetchedItem::ModSeq(entry.modseq));
                            }
                            data.push(Body::Data(Data::Fetch {
                                seq: (pos + 1) as u32,
                                items,
                            }));
                        }
                    }
                }
                JournalKind::Exists => new_arrivals = true,
            }
        }

        if new_arrivals {
            let messages = self.store.messages_in(&self.user, self.mailbox.id).await?;
            self.seen_modseq = messages
                .iter()
                .map(|m| m.modseq)
                .max()
                .unwrap_or(0)
                .max(self.seen_modseq);
            self.known = messages
                .iter()
                .map(|m| KnownMail {
                    id: m.id,
                    uid: m.uid,
                    flags: m.flags.clone(),
                })
                .collect();
            if let Some(mbx) = self.store.mailbox_by_id(&self.user, self.mailbox.id).await? {
                self.mailbox = mbx;
            }
            data.push(Body::Data(Data::Exists(self.exists())));
        }
        Ok(data)
    }

    pub async fn store_flags(
        &mut self,
        sequence_set: &SequenceSet,
        action: StoreAction,
        response: StoreResponse,
        flags: &[Flag],
        unchanged_since: Option<u64>,
        is_uid_store: bool,
    ) -> Result<(Vec<Body>, Vec<u32>)> {
        let messages = self.store.messages_in(&self.user, self.mailbox.id).await?;
        let (editable, conflicting): (Vec<MessageId>, Vec<u32>) = {
            let idx = Index::new(&messages);
            let (editable, conflicting) =
                idx.fetch_unchanged_since(sequence_set, unchanged_since, is_uid_store);
            (
                editable.iter().map(|m| m.message.id).collect(),
                conflicting
                    .iter()
                    .map(|m| if is_uid_store { m.uid } else { m.i })
                    .collect(),
            )
        };

        let flag_strings: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
        let mut journal = Vec::new();
        let mut changes = Vec::new();
        let mut silence = HashSet::new();
        for id in editable {
            let update = match action {
                StoreAction::Add => FlagUpdate::Add(flag_strings.clone()),
                StoreAction::Remove => FlagUpdate::Remove(flag_strings.clone()),
                StoreAction::Replace => FlagUpdate::Replace(flag_strings.clone()),
            };
            let updated = self.store.update_flags(&self.user, id, update).await?;
            journal.push(JournalEntry::new(
                self.mailbox.id,
                updated.modseq,
                JournalKind::Fetch,
                updated.uid,
                id,
                updated.flags.clone(),
            ));
            changes.push((ChangeKind::Updated, id.to_string()));
            if matches!(response, StoreResponse::Silent) {
                silence.insert(id);
            }
        }
        self.notifier.publish(&self.user, journal, changes).await?;

        let summary = self
            .update(UpdateParameters {
                silence,
                with_uid: is_uid_store,
                with_modseq: unchanged_since.is_some(),
            })
            .await?;
        Ok((summary, conflicting))
    }

    pub async fn expunge(&mut self, uid_filter: &Option<SequenceSet>) -> Result<Vec<Body>> {
        let messages = self.store.messages_in(&self.user, self.mailbox.id).await?;
        let doomed: Vec<MessageId> = {
            let idx = Index::new(&messages);
            let selection = match uid_filter {
                Some(set) => idx.fetch_on_uid(set),
                None => idx.entries.iter().collect(),
            };
            selection
                .into_iter()
                .filter(|m| m.message.has_flag(FLAG_DELETED))
                .map(|m| m.message.id)
                .collect()
        };

        let mut journal = Vec::new();
        let mut changes = Vec::new();
        for id in doomed {
            let deleted = self.store.delete_message(&self.user, id).await?;
            journal.push(JournalEntry::new(
                self.mailbox.id,
                deleted.modseq,
                JournalKind::Expunge,
                deleted.uid,
                id,
                vec![],
            ));
            changes.push((ChangeKind::Destroyed, id.to_string()));
        }
        self.notifier.publish(&self.user, journal, changes).await?;

        self.update(UpdateParameters::default()).await
    }

    pub async fn fetch(
        &mut self,
        sequence_set: &SequenceSet,
        items: &FetchItems,
        changed_since: Option<u64>,
        is_uid_fetch: bool,
    ) -> Result<Vec<Body>> {
        let messages = self.store.messages_in(&self.user, self.mailbox.id).await?;
        let selection: Vec<(u32, Message)> = {
            let idx = Index::new(&messages);
            idx.fetch_changed_since(sequence_set, changed_since, is_uid_fetch)
                .into_iter()
                .map(|m| (m.i, m.message.clone()))
                .collect()
        };

        let mut attrs = items.expand();
        // a UID FETCH always reports the UID, asked for or not
        if is_uid_fetch && !attrs.contains(&FetchItem::Uid) {
            attrs.push(FetchItem::Uid);
        }
        // CHANGEDSINCE implies MODSEQ in the reply
        if changed_since.is_some() && !attrs.contains(&FetchItem::ModSeq) {
            attrs.push(FetchItem::ModSeq);
        }
        let needs_source = attrs.iter().any(|a| {
            matches!(
                a,
                FetchItem::Rfc822 | FetchItem::Rfc822Header | FetchItem::Rfc822Text
            ) || matches!(a, FetchItem::Body { .. })
        });
        let marks_seen = attrs.iter().any(|a| {
            matches!(a, FetchItem::Rfc822 | FetchItem::Rfc822Text)
                || matches!(a, FetchItem::Body { peek: false, .. })
        });

        let mut data = Vec::new();
        for (seq, msg) in selection {
            let source = match needs_source {
                true => self.store.message_source(&self.user, msg.id).await?,
                false => vec![],
            };
            let mut fetched = Vec::with_capacity(attrs.len());
            for attr in &attrs {
                fetched.push(build_item(attr, &msg, &source));
            }
            data.push(Body::Data(Data::Fetch {
                seq,
                items: fetched,
            }));

            if marks_seen && msg.unseen {
                let updated = self
                    .store
                    .update_flags(
                        &self.user,
                        msg.id,
                        FlagUpdate::Add(vec![FLAG_SEEN.to_string()]),
                    )
                    .await?;
                self.notifier
                    .publish(
                        &self.user,
                        vec![JournalEntry::new(
                            self.mailbox.id,
                            updated.modseq,
                            JournalKind::Fetch,
                            updated.uid,
                            msg.id,
                            updated.flags.clone(),
                        )],
                        vec![(ChangeKind::Updated, msg.id.to_string())],
                    )
                    .await?;
            }
        }
        Ok(data)
    }

    pub async fn search(
        &self,
        criteria: &[SearchKey],
        uid: bool,
    ) -> Result<(Vec<Body>, bool)> {
        let messages = self.store.messages_in(&self.user, self.mailbox.id).await?;
        let idx = Index::new(&messages);
        let ctx = SearchContext {
            count: idx.count(),
            largest_uid: idx.largest_uid(),
        };
        let crit = Criteria(criteria);

        let mut hits: Vec<(u32, u64)> = Vec::new();
        for midx in idx.entries.iter() {
            // stage one on persisted attributes, stage two only when the
            // verdict depends on message content
            let keep = match crit.eval_meta(midx, ctx) {
                Some(verdict) => verdict,
                None => crit.eval_full(midx, ctx),
            };
            if keep {
                hits.push((if uid { midx.uid } else { midx.i }, midx.modseq));
            }
        }

        let maybe_modseq = match crit.references_modseq() {
            true => hits.iter().map(|(_, modseq)| *modseq).max(),
            false => None,
        };
        let ids = hits.into_iter().map(|(id, _)| id).collect();
        Ok((
            vec![Body::Data(Data::Search(ids, maybe_modseq))],
            maybe_modseq.is_some(),
        ))
    }

    pub async fn copy_to(
        &self,
        sequence_set: &SequenceSet,
        to: &Mailbox,
        is_uid_copy: bool,
    ) -> Result<(u32, Vec<(u32, u32)>)> {
        let messages = self.store.messages_in(&self.user, self.mailbox.id).await?;
        let picked: Vec<(MessageId, u32)> = {
            let idx = Index::new(&messages);
            idx.fetch(sequence_set, is_uid_copy)
                .into_iter()
                .map(|m| (m.message.id, m.uid))
                .collect()
        };

        let mut uid_map = Vec::with_capacity(picked.len());
        let mut journal = Vec::new();
        let mut changes = Vec::new();
        for (id, src_uid) in picked {
            let copied = self.store.copy_message(&self.user, id, to.id).await?;
            journal.push(JournalEntry::new(
                to.id,
                copied.modseq,
                JournalKind::Exists,
                copied.uid,
                copied.id,
                copied.flags.clone(),
            ));
            changes.push((ChangeKind::Created, copied.id.to_string()));
            uid_map.push((src_uid, copied.uid));
        }
        self.notifier.publish(&self.user, journal, changes).await?;

        Ok((to.uid_validity, uid_map))
    }

    pub async fn move_to(
        &mut self,
        sequence_set: &SequenceSet,
        to: &Mailbox,
        is_uid_move: bool,
    ) -> Result<(u32, Vec<(u32, u32)>, Vec<Body>)> {
        let messages = self.store.messages_in(&self.user, self.mailbox.id).await?;
        let picked: Vec<(MessageId, u32)> = {
            let idx = Index::new(&messages);
            idx.fetch(sequence_set, is_uid_move)
                .into_iter()
                .map(|m| (m.message.id, m.uid))
                .collect()
        };

        let mut uid_map = Vec::with_capacity(picked.len());
        let mut journal = Vec::new();
        let mut changes = Vec::new();
        for (id, src_uid) in picked {
            let moved = self.store.move_message(&self.user, id, to.id).await?;
            journal.push(JournalEntry::new(
                self.mailbox.id,
                moved.modseq,
                JournalKind::Expunge,
                src_uid,
                id,
                vec![],
            ));
            journal.push(JournalEntry::new(
                to.id,
                moved.modseq,
                JournalKind::Exists,
                moved.uid,
                id,
                moved.flags.clone(),
            ));
            // a mailbox move keeps the JMAP object alive, so it surfaces
            // as an update, not a destroy/create pair
            changes.push((ChangeKind::Updated, id.to_string()));
            uid_map.push((src_uid, moved.uid));
        }
        self.notifier.publish(&self.user, journal, changes).await?;

        let update = self
            .update(UpdateParameters {
                with_uid: is_uid_move,
                ..UpdateParameters::default()
            })
            .await?;
        Ok((to.uid_validity, uid_map, update))
    }
}

// ---- FETCH attribute rendering ----

fn build_item(attr: &FetchItem, msg: &Message, source: &[u8]) -> FetchedItem {
    match attr {
        FetchItem::Flags => {
            FetchedItem::Flags(msg.flags.iter().map(|f| Flag::from_wire(f)).collect())
        }
        FetchItem::Uid => FetchedItem::Uid(msg.uid),
        FetchItem::InternalDate => FetchedItem::InternalDate(msg.idate),
        FetchItem::Rfc822Size => FetchedItem::Rfc822Size(msg.size),
        FetchItem::ModSeq => FetchedItem::ModSeq(msg.modseq),
        FetchItem::Envelope => FetchedItem::Envelope(envelope_of(&msg.headers)),
        FetchItem::Rfc822 => FetchedItem::Rfc822(source.to_vec()),
        FetchItem::Rfc822Header => FetchedItem::Rfc822Header(section_bytes(source, &Section::Header)),
        FetchItem::Rfc822Text => FetchedItem::Rfc822Text(section_bytes(source, &Section::Text)),
        FetchItem::BodyStructure => FetchedItem::BodyStructure {
            content_type: ("text".to_string(), "plain".to_string()),
            size: msg.size,
            lines: msg.text.lines().count() as u32,
        },
        FetchItem::Body {
            section,
            partial,
            peek: _,
        } => {
            let bytes = section_bytes(source, section);
            let (bytes, origin) = apply_partial(bytes, *partial);
            FetchedItem::BodySection {
                section_spec: section_spec(section),
                origin,
                data: Some(bytes),
            }
        }
    }
}

fn envelope_of(headers: &HeaderInfo) -> Envelope {
    let convert = |addrs: &[missive_collections::mail::message::Address]| {
        addrs
            .iter()
            .map(|a| {
                let (mailbox, host) = a.email.split_once('@').unwrap_or((a.email.as_str(), ""));
                CodecAddress {
                    name: a.name.clone(),
                    mailbox: mailbox.to_string(),
                    host: host.to_string(),
                }
            })
            .collect::<Vec<_>>()
    };
    Envelope {
        date: headers.get("date").map(str::to_string),
        subject: headers.subject.clone(),
        from: convert(&headers.from),
        to: convert(&headers.to),
        cc: convert(&headers.cc),
        bcc: convert(&headers.bcc),
        in_reply_to: headers.in_reply_to.clone(),
        message_id: headers.message_id.clone(),
    }
}

fn split_source(source: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = source.windows(4).position(|w| w == b"\r\n\r\n") {
        (&source[..pos + 2], &source[pos + 4..])
    } else if let Some(pos) = source.windows(2).position(|w| w == b"\n\n") {
        (&source[..pos + 1], &source[pos + 2..])
    } else {
        (source, &[])
    }
}

fn section_bytes(source: &[u8], section: &Section) -> Vec<u8> {
    let (head, body) = split_source(source);
    match section {
        Section::Full => source.to_vec(),
        Section::Text => body.to_vec(),
        Section::Header => {
            let mut out = head.to_vec();
            out.extend_from_slice(b"\r\n");
            out
        }
        Section::HeaderFields(wanted) => filter_header_fields(head, wanted, false),
        Section::HeaderFieldsNot(unwanted) => filter_header_fields(head, unwanted, true),
    }
}

fn filter_header_fields(head: &[u8], fields: &[String], invert: bool) -> Vec<u8> {
    let text = String::from_utf8_lossy(head);
    let mut out = Vec::new();
    let mut keeping = false;
    for line in text.split_inclusive('\n') {
        let is_continuation = line.starts_with(' ') || line.starts_with('\t');
        if !is_continuation {
            let name = line.split(':').next().unwrap_or("").trim();
            let listed = fields.iter().any(|f| f.eq_ignore_ascii_case(name));
            keeping = listed != invert;
        }
        if keeping {
            out.extend_from_slice(line.as_bytes());
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn apply_partial(bytes: Vec<u8>, partial: Option<(u32, u32)>) -> (Vec<u8>, Option<u32>) {
    match partial {
        None => (bytes, None),
        Some((start, len)) => {
            let start_idx = (start as usize).min(bytes.len());
            let end_idx = (start_idx + len as usize).min(bytes.len());
            (bytes[start_idx..end_idx].to_vec(), Some(start))
        }
    }
}

fn section_spec(section: &Section) -> String {
    match section {
        Section::Full => String::new(),
        Section::Header => "HEADER".to_string(),
        Section::Text => "TEXT".to_string(),
        Section::HeaderFields(fields) => {
            format!("HEADER.FIELDS ({})", fields.join(" ").to_uppercase())
        }
        Section::HeaderFieldsNot(fields) => {
            format!("HEADER.FIELDS.NOT ({})", fields.join(" ").to_uppercase())
        }
    }
}
