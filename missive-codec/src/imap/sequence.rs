use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A single element of a sequence-set: a number or `*`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqOrUid {
    Value(u32),
    Asterisk,
}

impl SeqOrUid {
    fn expand(&self, largest: u32) -> u32 {
        match self {
            Self::Value(v) => *v,
            Self::Asterisk => largest,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sequence {
    Single(SeqOrUid),
    Range(SeqOrUid, SeqOrUid),
}

/// Set of seq-number values, regardless of order.
///
/// `2,4:7,9,12:*` over a mailbox of 15 messages means
/// `2,4,5,6,7,9,12,13,14,15`. Reversed ranges are equivalent to their
/// sorted form (`4:2` is `2:4`), `*` is the largest number in use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceSet(pub Vec<Sequence>);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceSetError {
    #[error("empty sequence set")]
    Empty,
    #[error("invalid sequence element: {0}")]
    InvalidElement(String),
}

impl SequenceSet {
    /// The `1:*` set.
    pub fn all() -> Self {
        Self(vec![Sequence::Range(
            SeqOrUid::Value(1),
            SeqOrUid::Asterisk,
        )])
    }

    /// Normalize into sorted, merged, disjoint inclusive ranges.
    ///
    /// `*` is clamped to `largest`; a range lying entirely above `largest`
    /// is dropped. The output is independent of element order, duplicates
    /// and range direction in the source text.
    fn normalized_ranges(&self, largest: u32) -> Vec<(u32, u32)> {
        if largest == 0 {
            return vec![];
        }
        let mut ranges: Vec<(u32, u32)> = Vec::with_capacity(self.0.len());
        for seq in self.0.iter() {
            let (lo, hi) = match seq {
                Sequence::Single(x) => {
                    let v = x.expand(largest);
                    (v, v)
                }
                Sequence::Range(a, b) => {
                    let a = a.expand(largest);
                    let b = b.expand(largest);
                    (a.min(b), a.max(b))
                }
            };
            ranges.push((lo, hi));
        }
        ranges.sort_unstable();

        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
        for (lo, hi) in ranges {
            match merged.last_mut() {
                Some((_, last_hi)) if lo <= last_hi.saturating_add(1) => {
                    *last_hi = (*last_hi).max(hi);
                }
                _ => merged.push((lo, hi)),
            }
        }
        merged
    }

    /// Resolve the set against a sorted identifier list (UIDs in UID mode).
    ///
    /// Out-of-range subsets resolve to nothing, silently. Runs in
    /// O((ranges + result) * log list) by binary-searching each merged
    /// range bound instead of walking the whole list per range.
    pub fn resolve(&self, sorted: &[u32]) -> Vec<u32> {
        let largest = match sorted.last() {
            Some(v) => *v,
            None => return vec![],
        };
        let mut out = Vec::new();
        for (lo, hi) in self.normalized_ranges(largest) {
            let a = sorted.partition_point(|&u| u < lo);
            let b = sorted.partition_point(|&u| u <= hi);
            out.extend_from_slice(&sorted[a..b]);
        }
        out
    }

    /// Resolve against message sequence numbers `1..=count`.
    pub fn resolve_seq(&self, count: u32) -> Vec<u32> {
        let mut out = Vec::new();
        for (lo, hi) in self.normalized_ranges(count) {
            out.extend(lo..=hi.min(count));
        }
        out
    }

    /// Membership test for a single identifier.
    pub fn contains(&self, value: u32, largest: u32) -> bool {
        self.0.iter().any(|seq| match seq {
            Sequence::Single(x) => x.expand(largest) == value,
            Sequence::Range(a, b) => {
                let a = a.expand(largest);
                let b = b.expand(largest);
                a.min(b) <= value && value <= a.max(b)
            }
        })
    }
}

impl FromStr for SequenceSet {
    type Err = SequenceSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(SequenceSetError::Empty);
        }
        let mut out = Vec::new();
        for part in s.split(',') {
            let parse_one = |txt: &str| -> Result<SeqOrUid, SequenceSetError> {
                if txt == "*" {
                    Ok(SeqOrUid::Asterisk)
                } else {
                    txt.parse::<u32>()
                        .ok()
                        .filter(|v| *v != 0)
                        .map(SeqOrUid::Value)
                        .ok_or_else(|| SequenceSetError::InvalidElement(part.to_string()))
                }
            };
            match part.split_once(':') {
                None => out.push(Sequence::Single(parse_one(part)?)),
                Some((a, b)) => out.push(Sequence::Range(parse_one(a)?, parse_one(b)?)),
            }
        }
        Ok(SequenceSet(out))
    }
}

impl fmt::Display for SeqOrUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{}", v),
            Self::Asterisk => write!(f, "*"),
        }
    }
}

impl fmt::Display for SequenceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seq) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match seq {
                Sequence::Single(x) => write!(f, "{}", x)?,
                Sequence::Range(a, b) => write!(f, "{}:{}", a, b)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn set(s: &str) -> SequenceSet {
        s.parse().unwrap()
    }

    #[test]
    fn resolves_against_uid_list() {
        let uids = [39, 40, 44, 52, 53, 54, 59, 72];
        assert_eq!(set("44,54:*").resolve(&uids), vec![44, 54, 59, 72]);
        assert_eq!(set("1,2,4:6").resolve_seq(uids.len() as u32), vec![
            1, 2, 4, 5, 6
        ]);
    }

    #[test]
    fn reversed_range_equals_sorted_range() {
        let uids = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        assert_eq!(set("5:9").resolve(&uids), set("9:5").resolve(&uids));
        assert_eq!(set("5:9").resolve(&uids), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn duplicates_and_permutations_collapse() {
        let uids = [2, 3, 5, 8, 13];
        let a = set("2,3:5,2,5:3").resolve(&uids);
        let b = set("3:5,2").resolve(&uids);
        assert_eq!(a, b);
        assert_eq!(a, vec![2, 3, 5]);
    }

    #[test]
    fn out_of_range_is_silently_empty() {
        let uids = [10, 20, 30];
        assert_eq!(set("40:50").resolve(&uids), Vec::<u32>::new());
        assert_eq!(set("31:39").resolve(&uids), Vec::<u32>::new());
        assert_eq!(set("1").resolve(&[]), Vec::<u32>::new());
    }

    #[test]
    fn asterisk_clamps_to_largest() {
        let uids = [3, 7, 12];
        assert_eq!(set("*").resolve(&uids), vec![12]);
        assert_eq!(set("8:*").resolve(&uids), vec![12]);
        // 20:* over largest 12 is 12:20, still matching the last message
        assert_eq!(set("20:*").resolve(&uids), vec![12]);
    }

    #[test]
    fn contains_matches_resolution() {
        let s = set("1:3,8,10:*");
        assert!(s.contains(2, 12));
        assert!(s.contains(8, 12));
        assert!(s.contains(11, 12));
        assert!(!s.contains(5, 12));
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<SequenceSet>().is_err());
        assert!("0".parse::<SequenceSet>().is_err());
        assert!("a:b".parse::<SequenceSet>().is_err());
        assert!("1,,2".parse::<SequenceSet>().is_err());
    }

    #[test]
    fn large_sets_expand_quickly() {
        // 500 singles and 200 ranges over 200k uids
        let uids: Vec<u32> = (1..=200_000).map(|i| i * 2).collect();
        let mut text = String::new();
        for i in 0..500 {
            text.push_str(&format!("{},", i * 701 + 1));
        }
        for i in 0..200 {
            text.push_str(&format!("{}:{},", i * 1000 + 5, i * 1000 + 900));
        }
        text.pop();
        let s = set(&text);

        let t0 = Instant::now();
        let resolved = s.resolve(&uids);
        assert!(!resolved.is_empty());
        assert!(t0.elapsed().as_secs_f64() < 1.5);

        // full-mailbox expansion
        let t0 = Instant::now();
        let all = SequenceSet::all().resolve(&uids);
        assert_eq!(all.len(), uids.len());
        assert!(t0.elapsed().as_secs_f64() < 1.5);

        // mixed 3k elements over 500k uids
        let uids: Vec<u32> = (1..=500_000).collect();
        let mut text = String::new();
        for i in 0..3000 {
            text.push_str(&format!("{}:{},", i * 97 + 1, i * 97 + 60));
        }
        text.pop();
        let s = set(&text);
        let t0 = Instant::now();
        let resolved = s.resolve(&uids);
        assert!(!resolved.is_empty());
        assert!(t0.elapsed().as_secs_f64() < 3.0);
    }
}
