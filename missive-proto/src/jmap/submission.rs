use serde_json::{json, Map, Value};

use missive_collections::changelog::ChangeKind;
use missive_collections::mail::journal::{JournalEntry, JournalKind};
use missive_collections::mail::mailbox::SpecialUse;
use missive_collections::mail::store::{FlagUpdate, MessageStore};
use missive_collections::mail::MessageId;
use missive_collections::submitter::Submitter;

use crate::jmap::dispatch::JmapContext;
use crate::jmap::types::{MethodError, MethodResult};

/// EmailSubmission/set: hand a stored draft to the submitter, optionally
/// moving it to the Sent mailbox afterwards.
pub async fn set(ctx: &JmapContext, user: &str, args: Value) -> MethodResult {
    let move_to_sent = args
        .get("onSuccessMoveToSent")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut created = Map::new();
    let mut not_created = Map::new();
    if let Some(Value::Object(create)) = args.get("create") {
        for (cid, spec) in create {
            match submit_one(ctx, user, spec, move_to_sent).await {
                Ok(value) => {
                    created.insert(cid.clone(), value);
                }
                Err(e) => {
                    not_created.insert(
                        cid.clone(),
                        json!({"type": e.typ, "description": e.description}),
                    );
                }
            }
        }
    }

    let state = ctx
        .store
        .account_state(user)
        .await
        .map_err(MethodError::server_fail)?;
    Ok(json!({
        "accountId": user,
        "newState": state.to_string(),
        "created": created,
        "notCreated": not_created,
    }))
}

async fn submit_one(
    ctx: &JmapContext,
    user: &str,
    spec: &Value,
    move_to_sent: bool,
) -> MethodResult {
    let email_id = spec
        .get("emailId")
        .and_then(Value::as_str)
        .ok_or_else(|| MethodError::invalid_arguments("emailId is required"))?
        .parse::<MessageId>()
        .map_err(|_| MethodError::invalid_arguments("bad email id"))?;

    let msg = ctx
        .store
        .message(user, email_id)
        .await
        .map_err(MethodError::server_fail)?
        .ok_or(MethodError {
            typ: "notFound",
            description: None,
        })?;
    let source = ctx
        .store
        .message_source(user, email_id)
        .await
        .map_err(MethodError::server_fail)?;

    // envelope defaults come from the message headers
    let envelope_from = spec
        .get("envelope")
        .and_then(|e| e.get("mailFrom"))
        .and_then(|m| m.get("email"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| msg.headers.from.first().map(|a| a.email.clone()))
        .ok_or_else(|| MethodError::invalid_arguments("no envelope sender"))?;
    let rcpt_to: Vec<String> = spec
        .get("envelope")
        .and_then(|e| e.get("rcptTo"))
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|r| r.get("email").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_else(|| {
            msg.headers
                .to
                .iter()
                .chain(msg.headers.cc.iter())
                .chain(msg.headers.bcc.iter())
                .map(|a| a.email.clone())
                .collect()
        });
    if rcpt_to.is_empty() {
        return Err(MethodError::invalid_arguments("no recipients"));
    }

    let submission_id = ctx
        .submitter
        .submit(user, &envelope_from, &rcpt_to, &source)
        .await
        .map_err(MethodError::server_fail)?;
    tracing::info!(user, submission = %submission_id, "message submitted");

    if move_to_sent {
        move_to_sent_mailbox(ctx, user, &msg).await?;
    }

    Ok(json!({
        "id": submission_id,
        "emailId": email_id.to_string(),
        "undoStatus": "final",
    }))
}

async fn move_to_sent_mailbox(
    ctx: &JmapContext,
    user: &str,
    msg: &missive_collections::mail::message::Message,
) -> Result<(), MethodError> {
    let mailboxes = ctx
        .store
        .list_mailboxes(user)
        .await
        .map_err(MethodError::server_fail)?;
    let sent = match mailboxes
        .iter()
        .find(|m| matches!(m.special_use, SpecialUse::Sent))
    {
        Some(sent) => sent.clone(),
        None => ctx
            .store
            .create_mailbox(user, "Sent", SpecialUse::Sent)
            .await
            .map_err(MethodError::server_fail)?,
    };
    if sent.id == msg.mailbox {
        return Ok(());
    }

    // drop the draft keyword along the way
    let _ = ctx
        .store
        .update_flags(
            user,
            msg.id,
            FlagUpdate::Remove(vec!["\\Draft".to_string()]),
        )
        .await;
    let moved = ctx
        .store
        .move_message(user, msg.id, sent.id)
        .await
        .map_err(MethodError::server_fail)?;
    ctx.notifier
        .publish(
            user,
            vec![
                JournalEntry::new(
                    msg.mailbox,
                    moved.modseq,
                    JournalKind::Expunge,
                    msg.uid,
                    msg.id,
                    vec![],
                ),
                JournalEntry::new(
                    sent.id,
                    moved.modseq,
                    JournalKind::Exists,
                    moved.uid,
                    msg.id,
                    moved.flags.clone(),
                ),
            ],
            vec![(ChangeKind::Updated, msg.id.to_string())],
        )
        .await
        .map_err(MethodError::server_fail)?;
    Ok(())
}
