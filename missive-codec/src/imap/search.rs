use chrono::NaiveDate;

use crate::imap::sequence::SequenceSet;

/// One SEARCH key. A whole search program is a `Vec<SearchKey>` combined
/// with implicit AND, matching the wire syntax.
#[derive(Clone, Debug, PartialEq)]
pub enum SearchKey {
    All,
    Answered,
    Bcc(String),
    Before(NaiveDate),
    Body(String),
    Cc(String),
    Deleted,
    Draft,
    Flagged,
    From(String),
    Header(String, String),
    Keyword(String),
    Larger(u32),
    ModSeq(u64),
    New,
    Not(Box<SearchKey>),
    Old,
    On(NaiveDate),
    Or(Box<SearchKey>, Box<SearchKey>),
    Recent,
    Seen,
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
    SequenceSet(SequenceSet),
    Since(NaiveDate),
    Smaller(u32),
    Subject(String),
    Text(String),
    To(String),
    Uid(SequenceSet),
    Unanswered,
    Undeleted,
    Undraft,
    Unflagged,
    Unkeyword(String),
    Unseen,
    And(Vec<SearchKey>),
}

impl SearchKey {
    pub fn and(keys: Vec<SearchKey>) -> SearchKey {
        match keys.len() {
            1 => keys.into_iter().next().unwrap(),
            _ => SearchKey::And(keys),
        }
    }
}
