use std::sync::Arc;

use serde_json::{json, Value};

use missive_collections::blob::BlobFacade;
use missive_collections::changelog::{ChangeKind, ChangeLog, MemChangeSink};
use missive_collections::mail::store::{ArcMessageStore, MemStore, MessageStore, NewMessage};
use missive_collections::mail::MessageId;
use missive_collections::notifier::Notifier;
use missive_collections::submitter::MemSubmitter;
use missive_proto::jmap::dispatch::{handle_request, JmapContext};
use missive_proto::jmap::types::{JmapRequest, MethodCall};
use missive_user::config::{ChangelogConfig, NotifierConfig};
use missive_user::storage::{ArcKvStore, MemKv};

struct Harness {
    ctx: JmapContext,
    store: ArcMessageStore,
    changelog: Arc<ChangeLog>,
    submitter: Arc<MemSubmitter>,
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
        kv.clone(),
        store.clone(),
        changelog.clone(),
        &NotifierConfig::default(),
    );
    let submitter = Arc::new(MemSubmitter::new());
    Harness {
        ctx: JmapContext {
            store: store.clone(),
            changelog: changelog.clone(),
            notifier,
            blobs: BlobFacade::new(kv),
            submitter: submitter.clone(),
        },
        store,
        changelog,
        submitter,
    }
}

async fn call(harness: &Harness, calls: Vec<(&str, Value, &str)>) -> Vec<Value> {
    let request = JmapRequest {
        using: vec![
            "urn:ietf:params:jmap:core".to_string(),
            "urn:ietf:params:jmap:mail".to_string(),
        ],
        method_calls: calls
            .into_iter()
            .map(|(name, args, id)| MethodCall(name.to_string(), args, id.to_string()))
            .collect(),
    };
    handle_request(&harness.ctx, "alice", request)
        .await
        .method_responses
}

async fn seed(harness: &Harness, mailbox_path: &str, source: &[u8], flags: &[&str]) -> String {
    harness.store.ensure_user("alice").await.unwrap();
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
            flags: flags.iter().map(|f| f.to_string()).collect(),
            idate: None,
            source: source.to_vec(),
        })
        .await
        .unwrap();
    harness
        .changelog
        .append("alice", ChangeKind::Created, &msg.id.to_string())
        .await
        .unwrap();
    msg.id.to_string()
}

async fn inbox_id(harness: &Harness) -> String {
    harness.store.ensure_user("alice").await.unwrap();
    harness
        .store
        .mailbox_by_path("alice", "INBOX")
        .await
        .unwrap()
        .unwrap()
        .id
        .to_string()
}

const MSG: &[u8] = b"Subject: greetings\r\nFrom: Bob <bob@example.tld>\r\nTo: alice@example.tld\r\n\r\nhello alice\r\n";

#[tokio::test]
async fn back_references_resolve_between_calls() {
    let harness = harness();
    let inbox = inbox_id(&harness).await;
    seed(&harness, "INBOX", MSG, &[]).await;
    seed(&harness, "INBOX", MSG, &[]).await;

    let responses = call(
        &harness,
        vec![
            (
                "Email/query",
                json!({"filter": {"inMailbox": inbox}, "limit": 10}),
                "a",
            ),
            (
                "Email/get",
                json!({"ids": {"resultOf": "a", "name": "Email/query", "path": "/ids"}}),
                "b",
            ),
        ],
    )
    .await;

    assert_eq!(responses[0][0], "Email/query");
    assert_eq!(responses[0][1]["ids"].as_array().unwrap().len(), 2);
    assert_eq!(responses[1][0], "Email/get");
    assert_eq!(responses[1][2], "b");
    let list = responses[1][1]["list"].as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["subject"], "greetings");
    assert_eq!(list[0]["from"][0]["email"], "bob@example.tld");
}

#[tokio::test]
async fn keyword_update_uses_replacement_semantics() {
    let harness = harness();
    let id = seed(&harness, "INBOX", MSG, &["\\Seen", "\\Flagged"]).await;

    let responses = call(
        &harness,
        vec![(
            "Email/set",
            json!({"update": {id.clone(): {"keywords": {"$flagged": true}}}}),
            "a",
        )],
    )
    .await;
    assert_eq!(responses[0][0], "Email/set");
    assert!(responses[0][1]["updated"].get(&id).is_some());

    // $seen was absent from the map, so it is gone
    let msg = harness
        .store
        .message("alice", id.parse::<MessageId>().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.flags, vec!["\\Flagged"]);
    assert!(msg.unseen);
    assert!(msg.flagged);
}

#[tokio::test]
async fn changes_past_the_retained_window_are_uncalculable() {
    let harness = harness();
    harness.store.ensure_user("alice").await.unwrap();
    // drive the state to 10000; only the newest 5000 entries survive
    let batch: Vec<(ChangeKind, String)> = (0..10_000)
        .map(|i| (ChangeKind::Created, format!("m{}", i)))
        .collect();
    harness
        .changelog
        .append_bulk("alice", &batch)
        .await
        .unwrap();

    let responses = call(
        &harness,
        vec![("Email/changes", json!({"sinceState": "100"}), "c1")],
    )
    .await;
    assert_eq!(
        responses[0],
        json!(["error", {"type": "cannotCalculateChanges", "description": null}, "c1"])
    );
}

#[tokio::test]
async fn changes_within_the_window_are_categorized() {
    let harness = harness();
    let id = seed(&harness, "INBOX", MSG, &[]).await;
    harness
        .changelog
        .append("alice", ChangeKind::Updated, &id)
        .await
        .unwrap();

    let responses = call(
        &harness,
        vec![("Email/changes", json!({"sinceState": "0"}), "c1")],
    )
    .await;
    assert_eq!(responses[0][0], "Email/changes");
    let body = &responses[0][1];
    assert_eq!(body["created"], json!([id]));
    assert_eq!(body["updated"], json!([]));
    assert_eq!(body["newState"], "2");
}

#[tokio::test]
async fn unknown_methods_error_per_call() {
    let harness = harness();
    harness.store.ensure_user("alice").await.unwrap();
    let responses = call(
        &harness,
        vec![
            ("Email/frobnicate", json!({}), "x"),
            ("Mailbox/get", json!({}), "y"),
        ],
    )
    .await;
    assert_eq!(responses[0][0], "error");
    assert_eq!(responses[0][1]["type"], "unknownMethod");
    // the batch continues past a failed call
    assert_eq!(responses[1][0], "Mailbox/get");
}

#[tokio::test]
async fn query_filters_and_sorts() {
    let harness = harness();
    seed(&harness, "INBOX", MSG, &["\\Seen"]).await;
    let unread = seed(
        &harness,
        "INBOX",
        b"Subject: urgent\r\nFrom: c@c.c\r\n\r\nimportant text\r\n",
        &[],
    )
    .await;

    let responses = call(
        &harness,
        vec![
            ("Email/query", json!({"filter": {"notKeyword": "$seen"}}), "a"),
            ("Email/query", json!({"filter": {"text": "important"}}), "b"),
            ("Email/query", json!({"filter": {"subject": "urgent"}}), "c"),
            (
                "Email/query",
                json!({"sort": [{"property": "size", "isAscending": true}]}),
                "d",
            ),
        ],
    )
    .await;

    assert_eq!(responses[0][1]["ids"], json!([unread]));
    assert_eq!(responses[1][1]["ids"], json!([unread]));
    assert_eq!(responses[2][1]["ids"], json!([unread]));
    let by_size = responses[3][1]["ids"].as_array().unwrap();
    assert_eq!(by_size.len(), 2);
    assert_eq!(by_size[0], json!(unread));
}

#[tokio::test]
async fn mailbox_get_exposes_roles_and_counts() {
    let harness = harness();
    seed(&harness, "INBOX", MSG, &[]).await;

    let responses = call(&harness, vec![("Mailbox/get", json!({}), "a")]).await;
    let list = responses[0][1]["list"].as_array().unwrap();
    let inbox = list
        .iter()
        .find(|m| m["role"] == "inbox")
        .expect("INBOX present");
    assert_eq!(inbox["name"], "INBOX");
    assert_eq!(inbox["totalEmails"], 1);
    assert_eq!(inbox["unreadEmails"], 1);
}

#[tokio::test]
async fn set_creates_drafts_and_destroys_messages() {
    let harness = harness();
    let inbox = inbox_id(&harness).await;
    let existing = seed(&harness, "INBOX", MSG, &[]).await;

    let responses = call(
        &harness,
        vec![(
            "Email/set",
            json!({
                "create": {
                    "d1": {
                        "mailboxIds": {inbox.clone(): true},
                        "keywords": {"$draft": true},
                        "subject": "wip",
                        "from": [{"email": "alice@example.tld"}],
                        "to": [{"email": "bob@example.tld"}],
                        "bodyValues": {"1": {"value": "draft body"}},
                    }
                },
                "destroy": [existing.clone()],
            }),
            "a",
        )],
    )
    .await;

    let body = &responses[0][1];
    let created_id = body["created"]["d1"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["destroyed"], json!([existing]));

    let msg = harness
        .store
        .message("alice", created_id.parse::<MessageId>().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(msg.draft);
    assert_eq!(msg.headers.subject.as_deref(), Some("wip"));
    assert!(msg.text.contains("draft body"));

    assert!(harness
        .store
        .message("alice", existing.parse::<MessageId>().unwrap())
        .await
        .unwrap()
        .is_none());

    // both mutations landed in the change log
    let changes = harness.changelog.changes_since("alice", 1).await.unwrap();
    assert!(changes.created.contains(&created_id));
    assert!(changes.destroyed.contains(&existing));
}

#[tokio::test]
async fn set_with_stale_state_mutates_nothing() {
    let harness = harness();
    let id = seed(&harness, "INBOX", MSG, &["\\Seen"]).await;

    let responses = call(
        &harness,
        vec![(
            "Email/set",
            json!({
                "ifInState": "999",
                "update": {id.clone(): {"keywords": {"$flagged": true}}},
            }),
            "a",
        )],
    )
    .await;
    assert_eq!(responses[0][0], "error");
    assert_eq!(responses[0][1]["type"], "stateMismatch");

    let msg = harness
        .store
        .message("alice", id.parse::<MessageId>().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.flags, vec!["\\Seen"]);
}

#[tokio::test]
async fn submission_sends_and_moves_to_sent() {
    let harness = harness();
    let draft = seed(&harness, "INBOX", MSG, &["\\Draft"]).await;

    let responses = call(
        &harness,
        vec![(
            "EmailSubmission/set",
            json!({
                "onSuccessMoveToSent": true,
                "create": {"s1": {"emailId": draft.clone()}},
            }),
            "a",
        )],
    )
    .await;
    assert_eq!(responses[0][0], "EmailSubmission/set");
    assert_eq!(responses[0][1]["created"]["s1"]["emailId"], draft);

    let sent = harness.submitter.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].envelope_from, "bob@example.tld");
    assert_eq!(sent[0].rcpt_to, vec!["alice@example.tld"]);

    let moved = harness
        .store
        .message("alice", draft.parse::<MessageId>().unwrap())
        .await
        .unwrap()
        .unwrap();
    let sent_mailbox = harness
        .store
        .mailbox_by_path("alice", "Sent")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moved.mailbox, sent_mailbox.id);
    assert!(!moved.draft);
}
