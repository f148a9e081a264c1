//! Sans-I/O codecs for the Missive mail server.
//!
//! The IMAP side turns one framed wire command (a line with its literals
//! already inlined) into a typed [`imap::types::Command`], and renders typed
//! responses back to bytes. The POP3 side does the same for its much simpler
//! line protocol. No socket ever shows up in this crate.

pub mod imap;
pub mod pop3;
