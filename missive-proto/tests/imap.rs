use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

use missive_collections::changelog::{ChangeKind, ChangeLog, MemChangeSink};
use missive_collections::mail::journal::{JournalEntry, JournalKind};
use missive_collections::mail::store::{ArcMessageStore, FlagUpdate, MemStore, MessageStore, NewMessage};
use missive_collections::notifier::Notifier;
use missive_proto::hooks::{ArcHooks, NoHooks};
use missive_proto::imap::{serve_connection, ServerContext};
use missive_user::config::{ChangelogConfig, LimitsConfig, NotifierConfig, UserList};
use missive_user::config::UserEntry;
use missive_user::login::static_provider::StaticLoginProvider;
use missive_user::login::ArcLoginProvider;
use missive_user::storage::{ArcKvStore, MemKv};

struct Harness {
    ctx: ServerContext,
    store: ArcMessageStore,
    notifier: Arc<Notifier>,
    _exit: watch::Sender<bool>,
}

fn users() -> UserList {
    let mut users = UserList::new();
    users.insert(
        "alice".to_string(),
        UserEntry {
            email_addresses: vec!["alice@example.tld".to_string()],
            password: "hunter2".to_string(),
        },
    );
    users
}

fn harness() -> Harness {
    let kv: ArcKvStore = Arc::new(MemKv::new());
    let store: ArcMessageStore = Arc::new(MemStore::new());
    let changelog = ChangeLog::new(
        kv.clone(),
        Arc::new(MemChangeSink::new()),
        &ChangelogConfig::default(),
    );
    let notifier = Notifier::new(
        kv,
        store.clone(),
        changelog,
        &NotifierConfig::default(),
    );
    let login: ArcLoginProvider = Arc::new(StaticLoginProvider::from_list(users()));
    let hooks: ArcHooks = Arc::new(NoHooks);

    let (exit_tx, exit_rx) = watch::channel(false);
    tokio::spawn(notifier.clone().run(exit_rx));

    Harness {
        ctx: ServerContext {
            login_provider: login,
            store: store.clone(),
            notifier: notifier.clone(),
            hooks,
            limits: LimitsConfig::default(),
            starttls: None,
        },
        store,
        notifier,
        _exit: exit_tx,
    }
}

fn connect(harness: &Harness) -> DuplexStream {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let ctx = harness.ctx.clone();
    let addr: SocketAddr = "127.0.0.1:49152".parse().unwrap();
    tokio::spawn(async move {
        let _ = serve_connection(server, addr, ctx, false).await;
    });
    client
}

async fn read_until(client: &mut DuplexStream, marker: &str) -> String {
    let mut collected = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("response timed out")
            .expect("read failed");
        assert!(
            n > 0,
            "connection closed before {:?}; got: {}",
            marker,
            String::from_utf8_lossy(&collected)
        );
        collected.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&collected);
        if text.contains(marker) {
            return text.into_owned();
        }
    }
}

async fn command(client: &mut DuplexStream, cmd: &str, tag: &str) -> String {
    client.write_all(cmd.as_bytes()).await.unwrap();
    read_until(client, &format!("{} ", tag)).await
}

async fn login(client: &mut DuplexStream) {
    read_until(client, "* OK [CAPABILITY").await;
    let resp = command(client, "a0 LOGIN alice hunter2\r\n", "a0").await;
    assert!(resp.contains("a0 OK"), "login failed: {}", resp);
}

async fn seed_message(harness: &Harness, mailbox_path: &str, source: &[u8]) -> (u32, String) {
    let mbx = harness
        .store
        .mailbox_by_path("alice", mailbox_path)
        .await
        .unwrap()
        .unwrap();
    let msg = harness
        .store
        .append_message(NewMessage {
            user: "alice".to_string(),
            mailbox: mbx.id,
            flags: vec![],
            idate: None,
            source: source.to_vec(),
        })
        .await
        .unwrap();
    harness
        .notifier
        .publish(
            "alice",
            vec![JournalEntry::new(
                mbx.id,
                msg.modseq,
                JournalKind::Exists,
                msg.uid,
                msg.id,
                msg.flags.clone(),
            )],
            vec![(ChangeKind::Created, msg.id.to_string())],
        )
        .await
        .unwrap();
    (msg.uid, msg.id.to_string())
}

const MSG1: &[u8] = b"Subject: first\r\nFrom: a@a.a\r\n\r\nbody one\r\n";
const MSG2: &[u8] = b"Subject: lunch\r\nFrom: b@b.b\r\n\r\npizza\r\n";
const MSG3: &[u8] = b"Subject: third\r\nFrom: c@c.c\r\n\r\nbody three\r\n";

#[tokio::test]
async fn greeting_capabilities_and_login() {
    let harness = harness();
    let mut client = connect(&harness);

    let greeting = read_until(&mut client, "\r\n").await;
    assert!(greeting.starts_with("* OK [CAPABILITY IMAP4rev1"));
    assert!(greeting.contains("CONDSTORE"));
    assert!(greeting.contains("COMPRESS=DEFLATE"));
    assert!(greeting.contains("LITERAL+"));

    let resp = command(&mut client, "a1 LOGIN alice hunter2\r\n", "a1").await;
    assert!(resp.contains("a1 OK"));
}

#[tokio::test]
async fn repeated_auth_failures_close_the_connection() {
    let harness = harness();
    let mut client = connect(&harness);
    read_until(&mut client, "* OK").await;

    for i in 1..=2 {
        let tag = format!("a{}", i);
        let resp = command(
            &mut client,
            &format!("{} LOGIN alice wrong\r\n", tag),
            &tag,
        )
        .await;
        assert!(resp.contains("NO"));
    }
    client
        .write_all(b"a3 LOGIN alice wrong\r\n")
        .await
        .unwrap();
    let resp = read_until(&mut client, "* BYE").await;
    assert!(resp.contains("* BYE Too many authentication failures"));
}

#[tokio::test]
async fn login_with_literals() {
    let harness = harness();
    let mut client = connect(&harness);
    read_until(&mut client, "* OK").await;

    client.write_all(b"a1 LOGIN {5}\r\n").await.unwrap();
    read_until(&mut client, "+ OK").await;
    client.write_all(b"alice {7}\r\n").await.unwrap();
    read_until(&mut client, "+ OK").await;
    client.write_all(b"hunter2\r\n").await.unwrap();
    let resp = read_until(&mut client, "a1 ").await;
    assert!(resp.contains("a1 OK"), "unexpected: {}", resp);
}

#[tokio::test]
async fn select_reports_the_mailbox_state() {
    let harness = harness();
    harness.store.ensure_user("alice").await.unwrap();
    seed_message(&harness, "INBOX", MSG1).await;
    seed_message(&harness, "INBOX", MSG2).await;

    let mut client = connect(&harness);
    login(&mut client).await;

    let resp = command(&mut client, "a1 SELECT INBOX (CONDSTORE)\r\n", "a1").await;
    assert!(resp.contains("* 2 EXISTS"));
    assert!(resp.contains("* FLAGS ("));
    assert!(resp.contains("[UIDVALIDITY "));
    assert!(resp.contains("[UIDNEXT 3]"));
    assert!(resp.contains("[HIGHESTMODSEQ "));
    assert!(resp.contains("a1 OK [READ-WRITE] SELECT completed"));
}

#[tokio::test]
async fn modseq_gated_store_reports_modified_uids() {
    let harness = harness();
    harness.store.ensure_user("alice").await.unwrap();
    let (_, _id1) = seed_message(&harness, "INBOX", MSG1).await;
    let (_, id2) = seed_message(&harness, "INBOX", MSG2).await;
    let (_, id3) = seed_message(&harness, "INBOX", MSG3).await;

    // bump modseqs so that uid 2 is the most recently changed:
    // uid1 keeps its append modseq, uid3 next, uid2 highest
    harness
        .store
        .update_flags(
            "alice",
            id3.parse().unwrap(),
            FlagUpdate::Add(vec!["$label1".to_string()]),
        )
        .await
        .unwrap();
    let m2 = harness
        .store
        .update_flags(
            "alice",
            id2.parse().unwrap(),
            FlagUpdate::Add(vec!["$label2".to_string()]),
        )
        .await
        .unwrap();
    let watermark = m2.modseq - 1;

    let mut client = connect(&harness);
    login(&mut client).await;
    command(&mut client, "a1 SELECT INBOX (CONDSTORE)\r\n", "a1").await;

    let resp = command(
        &mut client,
        &format!(
            "a2 UID STORE 1:3 (UNCHANGEDSINCE {}) +FLAGS (\\Seen)\r\n",
            watermark
        ),
        "a2",
    )
    .await;
    assert!(
        resp.contains("[MODIFIED 2]"),
        "expected MODIFIED 2 in: {}",
        resp
    );

    let resp = command(&mut client, "a3 UID FETCH 1:* (FLAGS)\r\n", "a3").await;
    let line_of = |uid: &str| {
        resp.lines()
            .find(|l| l.contains(&format!("UID {}", uid)))
            .unwrap_or_else(|| panic!("no FETCH line for uid {} in {}", uid, resp))
            .to_string()
    };
    assert!(line_of("1").contains("\\Seen"));
    assert!(!line_of("2").contains("\\Seen"));
    assert!(line_of("3").contains("\\Seen"));
}

#[tokio::test]
async fn search_composes_flags_text_and_modseq() {
    let harness = harness();
    harness.store.ensure_user("alice").await.unwrap();
    let (_, id1) = seed_message(&harness, "INBOX", MSG1).await;
    seed_message(&harness, "INBOX", MSG2).await;
    seed_message(&harness, "INBOX", MSG3).await;
    harness
        .store
        .update_flags(
            "alice",
            id1.parse().unwrap(),
            FlagUpdate::Add(vec!["\\Seen".to_string()]),
        )
        .await
        .unwrap();

    let mut client = connect(&harness);
    login(&mut client).await;
    command(&mut client, "a1 SELECT INBOX\r\n", "a1").await;

    let resp = command(&mut client, "a2 SEARCH SUBJECT lunch\r\n", "a2").await;
    assert!(resp.contains("* SEARCH 2\r\n"), "got: {}", resp);

    let resp = command(&mut client, "a3 SEARCH NOT SEEN\r\n", "a3").await;
    assert!(resp.contains("* SEARCH 2 3"), "got: {}", resp);

    let resp = command(&mut client, "a4 SEARCH OR SUBJECT lunch SUBJECT third\r\n", "a4").await;
    assert!(resp.contains("* SEARCH 2 3"), "got: {}", resp);

    // MODSEQ comparison really filters (and reports the max modseq)
    let resp = command(&mut client, "a5 SEARCH MODSEQ 4\r\n", "a5").await;
    assert!(resp.contains("* SEARCH 1 (MODSEQ 4)"), "got: {}", resp);
}

#[tokio::test]
async fn uid_sequence_sets_resolve_against_the_uid_list() {
    let harness = harness();
    harness.store.ensure_user("alice").await.unwrap();
    for _ in 0..5 {
        seed_message(&harness, "INBOX", MSG1).await;
    }

    let mut client = connect(&harness);
    login(&mut client).await;
    command(&mut client, "a1 SELECT INBOX\r\n", "a1").await;

    // reversed ranges, duplicates and * all collapse
    let resp = command(&mut client, "a2 UID SEARCH UID 4:2,3,5:*\r\n", "a2").await;
    assert!(resp.contains("* SEARCH 2 3 4 5\r\n"), "got: {}", resp);

    // out of range is silently empty
    let resp = command(&mut client, "a3 UID SEARCH UID 40:50\r\n", "a3").await;
    assert!(resp.contains("* SEARCH\r\n"), "got: {}", resp);
}

#[tokio::test]
async fn untagged_updates_precede_the_tagged_line() {
    let harness = harness();
    harness.store.ensure_user("alice").await.unwrap();

    let mut client = connect(&harness);
    login(&mut client).await;
    command(&mut client, "a1 SELECT INBOX\r\n", "a1").await;

    // a delivery lands while no command is running
    seed_message(&harness, "INBOX", MSG1).await;

    let resp = command(&mut client, "a2 NOOP\r\n", "a2").await;
    let exists_at = resp.find("* 1 EXISTS").expect("EXISTS is announced");
    let tagged_at = resp.find("a2 OK").expect("tagged completion");
    assert!(
        exists_at < tagged_at,
        "untagged data must precede the tagged line: {}",
        resp
    );
}

#[tokio::test]
async fn expunge_renumbers_sequences() {
    let harness = harness();
    harness.store.ensure_user("alice").await.unwrap();
    seed_message(&harness, "INBOX", MSG1).await;
    seed_message(&harness, "INBOX", MSG2).await;
    seed_message(&harness, "INBOX", MSG3).await;

    let mut client = connect(&harness);
    login(&mut client).await;
    command(&mut client, "a1 SELECT INBOX\r\n", "a1").await;

    command(&mut client, "a2 STORE 1,2 +FLAGS (\\Deleted)\r\n", "a2").await;
    let resp = command(&mut client, "a3 EXPUNGE\r\n", "a3").await;
    // both deletions are reported against the live sequence numbering
    assert!(resp.contains("* 1 EXPUNGE\r\n* 1 EXPUNGE"), "got: {}", resp);

    let resp = command(&mut client, "a4 FETCH 1 (UID)\r\n", "a4").await;
    assert!(resp.contains("UID 3"), "got: {}", resp);
}

#[tokio::test]
async fn fetch_serves_bodies_and_marks_seen() {
    let harness = harness();
    harness.store.ensure_user("alice").await.unwrap();
    seed_message(&harness, "INBOX", MSG1).await;

    let mut client = connect(&harness);
    login(&mut client).await;
    command(&mut client, "a1 SELECT INBOX\r\n", "a1").await;

    let resp = command(&mut client, "a2 FETCH 1 (BODY[] RFC822.SIZE)\r\n", "a2").await;
    assert!(resp.contains("body one"), "got: {}", resp);
    assert!(resp.contains(&format!("RFC822.SIZE {}", MSG1.len())));

    let resp = command(&mut client, "a3 FETCH 1 (FLAGS)\r\n", "a3").await;
    assert!(resp.contains("\\Seen"), "BODY[] fetch marks seen: {}", resp);

    let resp = command(
        &mut client,
        "a4 FETCH 1 (BODY.PEEK[HEADER.FIELDS (Subject)])\r\n",
        "a4",
    )
    .await;
    assert!(resp.contains("Subject: first"), "got: {}", resp);
    assert!(!resp.contains("From: a@a.a"));
}

#[tokio::test]
async fn idle_streams_updates_until_done() {
    let harness = harness();
    harness.store.ensure_user("alice").await.unwrap();

    let mut client = connect(&harness);
    login(&mut client).await;
    command(&mut client, "a1 SELECT INBOX\r\n", "a1").await;

    client.write_all(b"a2 IDLE\r\n").await.unwrap();
    read_until(&mut client, "+ idling").await;

    // a delivery during IDLE is pushed without any client command
    seed_message(&harness, "INBOX", MSG1).await;
    read_until(&mut client, "* 1 EXISTS").await;

    client.write_all(b"DONE\r\n").await.unwrap();
    let resp = read_until(&mut client, "a2 ").await;
    assert!(resp.contains("a2 OK IDLE completed"), "got: {}", resp);
}

#[tokio::test]
async fn compress_deflate_swaps_both_directions() {
    use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

    let harness = harness();
    let mut client = connect(&harness);
    login(&mut client).await;

    let resp = command(&mut client, "a1 COMPRESS DEFLATE\r\n", "a1").await;
    assert!(resp.contains("a1 OK"), "got: {}", resp);

    // outbound: compress a NOOP with raw deflate
    let mut z = Compress::new(Compression::default(), false);
    let mut compressed = Vec::with_capacity(64);
    z.compress_vec(b"a2 NOOP\r\n", &mut compressed, FlushCompress::Sync)
        .unwrap();
    client.write_all(&compressed).await.unwrap();

    // inbound: the response arrives deflated
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let text = loop {
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0);
        raw.extend_from_slice(&buf[..n]);
        let mut inflater = Decompress::new(false);
        let mut clear = Vec::with_capacity(4096);
        inflater
            .decompress_vec(&raw, &mut clear, FlushDecompress::None)
            .unwrap();
        let text = String::from_utf8_lossy(&clear).into_owned();
        if text.contains("a2 ") {
            break text;
        }
    };
    assert!(text.contains("a2 OK"), "got: {}", text);

    // a second COMPRESS is refused
    let mut z2 = Compress::new(Compression::default(), false);
    let mut compressed = Vec::with_capacity(64);
    z2.compress_vec(
        b"a3 COMPRESS DEFLATE\r\n",
        &mut compressed,
        FlushCompress::Sync,
    )
    .unwrap();
    client.write_all(&compressed).await.unwrap();
    let mut raw2 = Vec::new();
    let text = loop {
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0);
        raw.extend_from_slice(&buf[..n]);
        raw2 = raw.clone();
        let mut inflater = Decompress::new(false);
        let mut clear = Vec::with_capacity(8192);
        inflater
            .decompress_vec(&raw2, &mut clear, FlushDecompress::None)
            .unwrap();
        let text = String::from_utf8_lossy(&clear).into_owned();
        if text.contains("a3 ") {
            break text;
        }
    };
    assert!(text.contains("a3 NO [COMPRESSIONACTIVE]"), "got: {}", text);
}

#[tokio::test]
async fn wrong_state_commands_are_rejected() {
    let harness = harness();
    let mut client = connect(&harness);
    read_until(&mut client, "* OK").await;

    // selected-state command before authentication
    let resp = command(&mut client, "a1 FETCH 1 (FLAGS)\r\n", "a1").await;
    assert!(resp.contains("a1 BAD"), "got: {}", resp);

    let resp = command(&mut client, "a2 LOGIN alice hunter2\r\n", "a2").await;
    assert!(resp.contains("a2 OK"));

    // not-selected yet
    let resp = command(&mut client, "a3 EXPUNGE\r\n", "a3").await;
    assert!(resp.contains("a3 BAD"), "got: {}", resp);

    // double login
    let resp = command(&mut client, "a4 LOGIN alice hunter2\r\n", "a4").await;
    assert!(resp.contains("a4 BAD"), "got: {}", resp);
}

#[tokio::test]
async fn mailbox_management_round_trip() {
    let harness = harness();
    let mut client = connect(&harness);
    login(&mut client).await;

    let resp = command(&mut client, "a1 CREATE Archive/2024\r\n", "a1").await;
    assert!(resp.contains("a1 OK"));
    let resp = command(&mut client, "a2 LIST \"\" *\r\n", "a2").await;
    assert!(resp.contains("\"Archive/2024\""));
    assert!(resp.contains("\"INBOX\""));

    let resp = command(&mut client, "a3 LIST \"\" %\r\n", "a3").await;
    assert!(!resp.contains("Archive/2024"), "% stops at the delimiter: {}", resp);

    let resp = command(&mut client, "a4 RENAME Archive/2024 Archive/old\r\n", "a4").await;
    assert!(resp.contains("a4 OK"));

    let resp = command(
        &mut client,
        "a5 STATUS Archive/old (MESSAGES UIDNEXT UIDVALIDITY)\r\n",
        "a5",
    )
    .await;
    assert!(resp.contains("MESSAGES 0"));

    let resp = command(&mut client, "a6 DELETE Archive/old\r\n", "a6").await;
    assert!(resp.contains("a6 OK"));
}

#[tokio::test]
async fn append_copy_and_move_assign_uids() {
    let harness = harness();
    let mut client = connect(&harness);
    login(&mut client).await;
    command(&mut client, "a1 CREATE Archive\r\n", "a1").await;

    let literal = format!("a2 APPEND INBOX (\\Seen) {{{}+}}\r\n", MSG1.len());
    client.write_all(literal.as_bytes()).await.unwrap();
    client.write_all(MSG1).await.unwrap();
    client.write_all(b"\r\n").await.unwrap();
    let resp = read_until(&mut client, "a2 ").await;
    assert!(resp.contains("[APPENDUID "), "got: {}", resp);

    command(&mut client, "a3 SELECT INBOX\r\n", "a3").await;
    let resp = command(&mut client, "a4 UID COPY 1 Archive\r\n", "a4").await;
    assert!(resp.contains("[COPYUID "), "got: {}", resp);

    let resp = command(&mut client, "a5 UID MOVE 1 Archive\r\n", "a5").await;
    assert!(resp.contains("* 1 EXPUNGE"), "got: {}", resp);
    assert!(resp.contains("a5 OK"), "got: {}", resp);

    let resp = command(&mut client, "a6 STATUS Archive (MESSAGES)\r\n", "a6").await;
    assert!(resp.contains("MESSAGES 2"), "got: {}", resp);
}
