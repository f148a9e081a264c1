use missive_codec::imap::sequence::SequenceSet;
use missive_collections::mail::message::Message;

/// Ephemeral per-command view over a mailbox's messages, giving each one
/// its sequence number and resolving sequence-sets against it.
pub struct Index<'a> {
    pub entries: Vec<MailIndex<'a>>,
    uids: Vec<u32>,
}

#[derive(Clone, Copy)]
pub struct MailIndex<'a> {
    /// 1-based message sequence number.
    pub i: u32,
    pub uid: u32,
    pub modseq: u64,
    pub message: &'a Message,
}

impl<'a> Index<'a> {
    /// `messages` must be in ascending UID order, as the store returns them.
    pub fn new(messages: &'a [Message]) -> Self {
        let entries = messages
            .iter()
            .enumerate()
            .map(|(i, message)| MailIndex {
                i: (i + 1) as u32,
                uid: message.uid,
                modseq: message.modseq,
                message,
            })
            .collect::<Vec<_>>();
        let uids = messages.iter().map(|m| m.uid).collect();
        Self { entries, uids }
    }

    pub fn count(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn largest_uid(&self) -> u32 {
        self.uids.last().copied().unwrap_or(0)
    }

    /// Resolve a UID sequence-set. Inherits the resolver's complexity
    /// bound: no per-range scan of the whole mailbox.
    pub fn fetch_on_uid(&self, sequence_set: &SequenceSet) -> Vec<&MailIndex<'a>> {
        sequence_set
            .resolve(&self.uids)
            .into_iter()
            .map(|uid| {
                let pos = self.uids.partition_point(|&u| u < uid);
                &self.entries[pos]
            })
            .collect()
    }

    /// Resolve a message-sequence-number set.
    pub fn fetch_on_seq(&self, sequence_set: &SequenceSet) -> Vec<&MailIndex<'a>> {
        sequence_set
            .resolve_seq(self.count())
            .into_iter()
            .map(|seq| &self.entries[(seq - 1) as usize])
            .collect()
    }

    pub fn fetch(&self, sequence_set: &SequenceSet, by_uid: bool) -> Vec<&MailIndex<'a>> {
        match by_uid {
            true => self.fetch_on_uid(sequence_set),
            false => self.fetch_on_seq(sequence_set),
        }
    }

    /// CONDSTORE fetch gate: only entries whose modseq moved past the
    /// client's watermark.
    pub fn fetch_changed_since(
        &self,
        sequence_set: &SequenceSet,
        changed_since: Option<u64>,
        by_uid: bool,
    ) -> Vec<&MailIndex<'a>> {
        self.fetch(sequence_set, by_uid)
            .into_iter()
            .filter(|midx| match changed_since {
                Some(watermark) => midx.modseq > watermark,
                None => true,
            })
            .collect()
    }

    /// CONDSTORE store gate: splits the selection into entries still at or
    /// below the client's watermark (safe to edit) and entries someone
    /// else touched since (reported via MODIFIED, not edited).
    pub fn fetch_unchanged_since(
        &self,
        sequence_set: &SequenceSet,
        unchanged_since: Option<u64>,
        by_uid: bool,
    ) -> (Vec<&MailIndex<'a>>, Vec<&MailIndex<'a>>) {
        let selection = self.fetch(sequence_set, by_uid);
        match unchanged_since {
            None => (selection, vec![]),
            Some(watermark) => selection
                .into_iter()
                .partition(|midx| midx.modseq <= watermark),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use missive_collections::mail::message::HeaderInfo;
    use missive_collections::mail::{MailboxId, MessageId};

    fn message(uid: u32, modseq: u64) -> Message {
        let mut msg = Message {
            id: MessageId::generate(),
            user: "alice".to_string(),
            mailbox: MailboxId::generate(),
            uid,
            modseq,
            flags: vec![],
            unseen: true,
            flagged: false,
            draft: false,
            undeleted: true,
            idate: Utc::now(),
            hdate: Utc::now(),
            size: 100,
            thread: String::new(),
            headers: HeaderInfo::default(),
            text: String::new(),
            html: None,
            attachments: vec![],
        };
        msg.set_flags(vec![]);
        msg
    }

    #[test]
    fn uid_and_seq_resolution() {
        let msgs: Vec<Message> = [39, 40, 44, 52, 53, 54, 59, 72]
            .iter()
            .enumerate()
            .map(|(i, &uid)| message(uid, (i + 1) as u64))
            .collect();
        let idx = Index::new(&msgs);

        let picked = idx.fetch_on_uid(&"44,54:*".parse().unwrap());
        assert_eq!(
            picked.iter().map(|m| m.uid).collect::<Vec<_>>(),
            vec![44, 54, 59, 72]
        );

        let picked = idx.fetch_on_seq(&"1,2,4:6".parse().unwrap());
        assert_eq!(
            picked.iter().map(|m| m.uid).collect::<Vec<_>>(),
            vec![39, 40, 52, 53, 54]
        );
    }

    #[test]
    fn unchanged_since_partitions_the_selection() {
        let msgs = vec![message(1, 50), message(2, 80), message(3, 60)];
        let idx = Index::new(&msgs);
        let (editable, modified) =
            idx.fetch_unchanged_since(&"1:3".parse().unwrap(), Some(70), true);
        assert_eq!(editable.iter().map(|m| m.uid).collect::<Vec<_>>(), vec![
            1, 3
        ]);
        assert_eq!(modified.iter().map(|m| m.uid).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn changed_since_filters() {
        let msgs = vec![message(1, 50), message(2, 80), message(3, 60)];
        let idx = Index::new(&msgs);
        let picked = idx.fetch_changed_since(&"1:*".parse().unwrap(), Some(55), true);
        assert_eq!(picked.iter().map(|m| m.uid).collect::<Vec<_>>(), vec![
            2, 3
        ]);
    }
}
