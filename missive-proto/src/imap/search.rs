/*
 * SEARCH evaluation in two stages.
 *
 * Stage one runs against persisted attributes only (uid, sequence, flags,
 * size, dates, modseq) and returns a three-valued verdict: keys that need
 * message content answer "undecidable" and short-circuit accordingly.
 * Stage two runs the full predicate for the survivors that stage one
 * could not decide, with header and body text in hand.
 */

use chrono::{Datelike, NaiveDate};

use missive_codec::imap::search::SearchKey;
use missive_collections::mail::message::{Message, FLAG_ANSWERED, FLAG_DELETED, FLAG_DRAFT, FLAG_FLAGGED, FLAG_RECENT, FLAG_SEEN};

use crate::imap::index::MailIndex;

pub struct Criteria<'a>(pub &'a [SearchKey]);

/// Evaluation context shared by every key of one SEARCH run.
#[derive(Clone, Copy)]
pub struct SearchContext {
    /// Number of messages in the mailbox (clamps `*` for sequence sets).
    pub count: u32,
    /// Largest UID in use (clamps `*` for UID sets).
    pub largest_uid: u32,
}

impl<'a> Criteria<'a> {
    /// Does any key need header or body text, i.e. a stage-two pass?
    pub fn needs_content(&self) -> bool {
        self.0.iter().any(key_needs_content)
    }

    pub fn references_modseq(&self) -> bool {
        self.0.iter().any(key_references_modseq)
    }

    /// Stage one. `Some(verdict)` when decidable on metadata alone.
    pub fn eval_meta(&self, midx: &MailIndex<'_>, ctx: SearchContext) -> Option<bool> {
        and_tri(self.0.iter().map(|key| eval_key(key, midx, ctx, None)))
    }

    /// Stage two: the full predicate.
    pub fn eval_full(&self, midx: &MailIndex<'_>, ctx: SearchContext) -> bool {
        let content = ContentView::of(midx.message);
        and_tri(self.0.iter().map(|key| eval_key(key, midx, ctx, Some(&content))))
            .unwrap_or(false)
    }
}

fn key_needs_content(key: &SearchKey) -> bool {
    use SearchKey::*;
    match key {
        Bcc(_) | Body(_) | Cc(_) | From(_) | Header(..) | Subject(_) | Text(_) | To(_) => true,
        And(keys) => keys.iter().any(key_needs_content),
        Not(inner) => key_needs_content(inner),
        Or(left, right) => key_needs_content(left) || key_needs_content(right),
        _ => false,
    }
}

fn key_references_modseq(key: &SearchKey) -> bool {
    use SearchKey::*;
    match key {
        ModSeq(_) => true,
        And(keys) => keys.iter().any(key_references_modseq),
        Not(inner) => key_references_modseq(inner),
        Or(left, right) => key_references_modseq(left) || key_references_modseq(right),
        _ => false,
    }
}

/// Lazily assembled searchable text of a message.
struct ContentView<'a> {
    message: &'a Message,
}

impl<'a> ContentView<'a> {
    fn of(message: &'a Message) -> Self {
        Self { message }
    }

    fn header_contains(&self, field: &str, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.message
            .headers
            .raw
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(field))
            .any(|(_, value)| value.to_lowercase().contains(&needle))
    }

    fn address_contains(&self, addresses: &[missive_collections::mail::message::Address], needle: &str) -> bool {
        let needle = needle.to_lowercase();
        addresses.iter().any(|addr| {
            addr.email.to_lowercase().contains(&needle)
                || addr
                    .name
                    .as_ref()
                    .map(|n| n.to_lowercase().contains(&needle))
                    .unwrap_or(false)
        })
    }

    fn body_contains(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.message.text.to_lowercase().contains(&needle)
            || self
                .message
                .html
                .as_ref()
                .map(|html| html.to_lowercase().contains(&needle))
                .unwrap_or(false)
    }

    fn text_contains(&self, needle: &str) -> bool {
        if self.body_contains(needle) {
            return true;
        }
        let lowered = needle.to_lowercase();
        self.message
            .headers
            .raw
            .iter()
            .any(|(name, value)| {
                name.to_lowercase().contains(&lowered) || value.to_lowercase().contains(&lowered)
            })
    }
}

fn same_day(lhs: chrono::DateTime<chrono::Utc>, rhs: NaiveDate) -> std::cmp::Ordering {
    let lhs = lhs.date_naive();
    lhs.cmp(&rhs)
}

fn day_of(date: chrono::DateTime<chrono::Utc>) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), date.day())
        .expect("valid date from a valid datetime")
}

/// Three-valued evaluation of one key. `content` is `None` in stage one,
/// which makes content-dependent keys return `None` (undecidable).
fn eval_key(
    key: &SearchKey,
    midx: &MailIndex<'_>,
    ctx: SearchContext,
    content: Option<&ContentView<'_>>,
) -> Option<bool> {
    use SearchKey::*;
    let msg = midx.message;
    match key {
        All => Some(true),

        // flags, straight off the index
        Answered => Some(msg.has_flag(FLAG_ANSWERED)),
        Deleted => Some(msg.has_flag(FLAG_DELETED)),
        Draft => Some(msg.has_flag(FLAG_DRAFT)),
        Flagged => Some(msg.has_flag(FLAG_FLAGGED)),
        Recent => Some(msg.has_flag(FLAG_RECENT)),
        Seen => Some(msg.has_flag(FLAG_SEEN)),
        Unanswered => Some(!msg.has_flag(FLAG_ANSWERED)),
        Undeleted => Some(!msg.has_flag(FLAG_DELETED)),
        Undraft => Some(!msg.has_flag(FLAG_DRAFT)),
        Unflagged => Some(!msg.has_flag(FLAG_FLAGGED)),
        Unseen => Some(!msg.has_flag(FLAG_SEEN)),
        Keyword(kw) => Some(msg.has_flag(kw)),
        Unkeyword(kw) => Some(!msg.has_flag(kw)),
        New => Some(msg.has_flag(FLAG_RECENT) && !msg.has_flag(FLAG_SEEN)),
        Old => Some(!msg.has_flag(FLAG_RECENT)),

        // identifiers
        SequenceSet(set) => Some(set.contains(midx.i, ctx.count)),
        Uid(set) => Some(set.contains(midx.uid, ctx.largest_uid)),

        // numeric attributes
        Larger(n) => Some(msg.size > *n),
        Smaller(n) => Some(msg.size < *n),
        ModSeq(v) => Some(msg.modseq >= *v),

        // internal date, compared on the day only
        Before(d) => Some(day_of(msg.idate) < *d),
        On(d) => Some(same_day(msg.idate, *d).is_eq()),
        Since(d) => Some(day_of(msg.idate) >= *d),

        // header date, also persisted
        SentBefore(d) => Some(day_of(msg.hdate) < *d),
        SentOn(d) => Some(same_day(msg.hdate, *d).is_eq()),
        SentSince(d) => Some(day_of(msg.hdate) >= *d),

        // content-dependent keys
        Bcc(needle) => content.map(|c| c.address_contains(&msg.headers.bcc, needle)),
        Cc(needle) => content.map(|c| c.address_contains(&msg.headers.cc, needle)),
        From(needle) => content.map(|c| c.address_contains(&msg.headers.from, needle)),
        To(needle) => content.map(|c| c.address_contains(&msg.headers.to, needle)),
        Subject(needle) => content.map(|c| {
            msg.headers
                .subject
                .as_ref()
                .map(|s| s.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false)
        }),
        Header(field, needle) => content.map(|c| c.header_contains(field, needle)),
        Body(needle) => content.map(|c| c.body_contains(needle)),
        Text(needle) => content.map(|c| c.text_contains(needle)),

        // combinators, short-circuiting over three values
        Not(inner) => eval_key(inner, midx, ctx, content).map(|v| !v),
        And(keys) => and_tri(keys.iter().map(|k| eval_key(k, midx, ctx, content))),
        Or(left, right) => or_tri(
            eval_key(left, midx, ctx, content),
            eval_key(right, midx, ctx, content),
        ),
    }
}

fn and_tri(values: impl Iterator<Item = Option<bool>>) -> Option<bool> {
    let mut undecided = false;
    for value in values {
        match value {
            Some(false) => return Some(false),
            None => undecided = true,
            Some(true) => (),
        }
    }
    match undecided {
        true => None,
        false => Some(true),
    }
}

fn or_tri(left: Option<bool>, right: Option<bool>) -> Option<bool> {
    match (left, right) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (None, _) | (_, None) => None,
        _ => Some(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::index::Index;
    use chrono::{TimeZone, Utc};
    use missive_collections::mail::message::{scan_headers, Message};
    use missive_collections::mail::{MailboxId, MessageId};

    fn message(uid: u32, modseq: u64, flags: &[&str], source: &[u8]) -> Message {
        let (headers, text) = scan_headers(source);
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
            idate: Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap(),
            hdate: headers
                .date
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.with_ymd_and_hms(2024, 3, 9, 8, 0, 0).unwrap()),
            size: source.len() as u32,
            thread: String::new(),
            headers,
            text,
            html: None,
            attachments: vec![],
        };
        msg.set_flags(flags.iter().map(|f| f.to_string()).collect());
        msg
    }

    fn mailbox() -> Vec<Message> {
        let mut msgs = vec![
            message(
                39,
                50,
                &["\\Seen"],
                b"Subject: rust news\r\nFrom: Alice <alice@example.tld>\r\n\r\nthe borrow checker\r\n",
            ),
            message(
                44,
                80,
                &["\\Flagged"],
                b"Subject: lunch\r\nFrom: Bob <bob@example.tld>\r\n\r\npizza at noon\r\n",
            ),
            message(
                54,
                60,
                &["\\Recent"],
                b"Subject: re: rust news\r\nFrom: carol@example.tld\r\n\r\nsee the checker in action\r\n",
            ),
        ];
        msgs[0].size = 100;
        msgs[1].size = 60;
        msgs[2].size = 90;
        msgs
    }

    fn run(criteria: Vec<SearchKey>, msgs: &[Message]) -> Vec<u32> {
        let idx = Index::new(msgs);
        let ctx = SearchContext {
            count: idx.count(),
            largest_uid: idx.largest_uid(),
        };
        let crit = Criteria(&criteria);
        idx.entries
            .iter()
            .filter(|midx| match crit.eval_meta(midx, ctx) {
                Some(verdict) => verdict,
                None => crit.eval_full(midx, ctx),
            })
            .map(|midx| midx.uid)
            .collect()
    }

    #[test]
    fn flags_and_negation() {
        let msgs = mailbox();
        assert_eq!(run(vec![SearchKey::Seen], &msgs), vec![39]);
        assert_eq!(
            run(vec![SearchKey::Not(Box::new(SearchKey::Seen))], &msgs),
            vec![44, 54]
        );
        assert_eq!(run(vec![SearchKey::New], &msgs), vec![54]);
        assert_eq!(run(vec![SearchKey::Old], &msgs), vec![39, 44]);
    }

    #[test]
    fn uid_set_and_not_sequence_composition() {
        // UID 44,54:* over [39,44,54] keeps 44 and 54
        let msgs = mailbox();
        assert_eq!(
            run(vec![SearchKey::Uid("44,54:*".parse().unwrap())], &msgs),
            vec![44, 54]
        );
        // NOT 1,2 as sequence numbers leaves only the third message
        assert_eq!(
            run(
                vec![SearchKey::Not(Box::new(SearchKey::SequenceSet(
                    "1,2".parse().unwrap()
                )))],
                &msgs
            ),
            vec![54]
        );
    }

    #[test]
    fn modseq_actually_compares() {
        let msgs = mailbox();
        assert_eq!(run(vec![SearchKey::ModSeq(60)], &msgs), vec![44, 54]);
        assert_eq!(run(vec![SearchKey::ModSeq(81)], &msgs), Vec::<u32>::new());
        // and composes with NOT
        assert_eq!(
            run(vec![SearchKey::Not(Box::new(SearchKey::ModSeq(60)))], &msgs),
            vec![39]
        );
    }

    #[test]
    fn size_and_dates() {
        let msgs = mailbox();
        assert_eq!(run(vec![SearchKey::Larger(80)], &msgs), vec![
            39, 54
        ]);
        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(run(vec![SearchKey::On(day)], &msgs), vec![39, 44, 54]);
        assert_eq!(
            run(vec![SearchKey::Before(day)], &msgs),
            Vec::<u32>::new()
        );
        assert_eq!(run(vec![SearchKey::Since(day)], &msgs), vec![39, 44, 54]);
    }

    #[test]
    fn content_keys_fall_back_to_stage_two() {
        let msgs = mailbox();
        assert_eq!(
            run(vec![SearchKey::From("alice".to_string())], &msgs),
            vec![39]
        );
        assert_eq!(
            run(vec![SearchKey::Subject("rust".to_string())], &msgs),
            vec![39, 54]
        );
        assert_eq!(
            run(vec![SearchKey::Body("checker".to_string())], &msgs),
            vec![39, 54]
        );
        assert_eq!(
            run(vec![SearchKey::Text("pizza".to_string())], &msgs),
            vec![44]
        );
        assert_eq!(
            run(
                vec![SearchKey::Header(
                    "From".to_string(),
                    "example.tld".to_string()
                )],
                &msgs
            ),
            vec![39, 44, 54]
        );
    }

    #[test]
    fn or_short_circuits_across_stages() {
        let msgs = mailbox();
        // Seen (meta, true for 39) OR Body (content): 39 must not need content
        let criteria = vec![SearchKey::Or(
            Box::new(SearchKey::Seen),
            Box::new(SearchKey::Body("pizza".to_string())),
        )];
        let idx = Index::new(&msgs);
        let ctx = SearchContext {
            count: idx.count(),
            largest_uid: idx.largest_uid(),
        };
        let crit = Criteria(&criteria);
        assert_eq!(crit.eval_meta(&idx.entries[0], ctx), Some(true));
        assert_eq!(crit.eval_meta(&idx.entries[1], ctx), None);
        assert_eq!(run(criteria, &msgs), vec![39, 44]);
    }

    #[test]
    fn and_of_meta_false_never_reads_content() {
        let msgs = mailbox();
        let criteria = vec![
            SearchKey::Flagged,
            SearchKey::Body("borrow".to_string()),
        ];
        let idx = Index::new(&msgs);
        let ctx = SearchContext {
            count: idx.count(),
            largest_uid: idx.largest_uid(),
        };
        // message 1 is not flagged: stage one already says no
        assert_eq!(
            Criteria(&criteria).eval_meta(&idx.entries[0], ctx),
            Some(false)
        );
        assert_eq!(run(criteria, &msgs), Vec::<u32>::new());
    }
}
