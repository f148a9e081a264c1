pub mod anonymous;
pub mod anystate;
pub mod authenticated;
pub mod selected;

/// LIST/LSUB pattern match: `*` crosses hierarchy levels, `%` stops at
/// the delimiter.
pub fn mailbox_pattern_matches(pattern: &str, path: &str) -> bool {
    fn rec(pattern: &[u8], path: &[u8]) -> bool {
        match pattern.first().copied() {
            None => path.is_empty(),
            Some(b'*') => (0..=path.len()).any(|i| rec(&pattern[1..], &path[i..])),
            Some(b'%') => (0..=path.len())
                .take_while(|&i| i == 0 || path[i - 1] != b'/')
                .any(|i| rec(&pattern[1..], &path[i..])),
            Some(c) => path.first() == Some(&c) && rec(&pattern[1..], &path[1..]),
        }
    }
    rec(pattern.as_bytes(), path.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards() {
        assert!(mailbox_pattern_matches("*", "Archive/2024/Receipts"));
        assert!(mailbox_pattern_matches("Archive/*", "Archive/2024/Receipts"));
        assert!(mailbox_pattern_matches("Archive/%", "Archive/2024"));
        assert!(!mailbox_pattern_matches("Archive/%", "Archive/2024/Receipts"));
        assert!(mailbox_pattern_matches("%", "INBOX"));
        assert!(!mailbox_pattern_matches("%", "Archive/2024"));
        assert!(mailbox_pattern_matches("INBOX", "INBOX"));
        assert!(!mailbox_pattern_matches("INBOX", "Archive"));
    }
}
