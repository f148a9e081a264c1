use serde_json::{json, Map, Value};

use missive_collections::changelog::ChangeKind;
use missive_collections::mail::journal::{JournalEntry, JournalKind};
use missive_collections::mail::message::Message;
use missive_collections::mail::store::{FlagUpdate, MessageStore, NewMessage};
use missive_collections::mail::{MailboxId, MessageId};

use crate::jmap::dispatch::JmapContext;
use crate::jmap::types::{MethodError, MethodResult};

pub const MAX_QUERY_LIMIT: usize = 1000;
const DEFAULT_QUERY_LIMIT: usize = 256;

/// JMAP keyword to IMAP flag (RFC 8621 §2).
pub fn keyword_to_flag(keyword: &str) -> String {
    match keyword {
        "$seen" => "\\Seen".to_string(),
        "$flagged" => "\\Flagged".to_string(),
        "$draft" => "\\Draft".to_string(),
        "$answered" => "\\Answered".to_string(),
        other => other.to_string(),
    }
}

pub fn flag_to_keyword(flag: &str) -> Option<String> {
    if flag.eq_ignore_ascii_case("\\Seen") {
        Some("$seen".to_string())
    } else if flag.eq_ignore_ascii_case("\\Flagged") {
        Some("$flagged".to_string())
    } else if flag.eq_ignore_ascii_case("\\Draft") {
        Some("$draft".to_string())
    } else if flag.eq_ignore_ascii_case("\\Answered") {
        Some("$answered".to_string())
    } else if flag.starts_with('\\') {
        // \Recent, \Deleted and friends stay internal
        None
    } else {
        Some(flag.to_string())
    }
}

async fn all_messages(ctx: &JmapContext, user: &str) -> Result<Vec<Message>, MethodError> {
    let mut out = Vec::new();
    let mailboxes = ctx
        .store
        .list_mailboxes(user)
        .await
        .map_err(MethodError::server_fail)?;
    for mbx in mailboxes {
        out.extend(
            ctx.store
                .messages_in(user, mbx.id)
                .await
                .map_err(MethodError::server_fail)?,
        );
    }
    Ok(out)
}

fn account_state_error(e: impl std::fmt::Display) -> MethodError {
    MethodError::server_fail(e)
}

pub async fn query(ctx: &JmapContext, user: &str, args: Value) -> MethodResult {
    let filter = args.get("filter").cloned().unwrap_or(Value::Null);
    let in_mailbox = match filter.get("inMailbox").and_then(Value::as_str) {
        None => None,
        Some(raw) => Some(
            raw.parse::<MailboxId>()
                .map_err(|_| MethodError::invalid_arguments("bad inMailbox id"))?,
        ),
    };
    let has_keyword = filter
        .get("hasKeyword")
        .and_then(Value::as_str)
        .map(keyword_to_flag);
    let not_keyword = filter
        .get("notKeyword")
        .and_then(Value::as_str)
        .map(keyword_to_flag);
    let text = filter
        .get("text")
        .and_then(Value::as_str)
        .map(str::to_lowercase);
    let subject = filter
        .get("subject")
        .and_then(Value::as_str)
        .map(str::to_lowercase);

    let mut messages = match in_mailbox {
        Some(mailbox) => ctx
            .store
            .messages_in(user, mailbox)
            .await
            .map_err(MethodError::server_fail)?,
        None => all_messages(ctx, user).await?,
    };

    messages.retain(|m| {
        if let Some(flag) = &has_keyword {
            if !m.has_flag(flag) {
                return false;
            }
        }
        if let Some(flag) = &not_keyword {
            if m.has_flag(flag) {
                return false;
            }
        }
        if let Some(needle) = &subject {
            let matched = m
                .headers
                .subject
                .as_ref()
                .map(|s| s.to_lowercase().contains(needle))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        if let Some(needle) = &text {
            let in_subject = m
                .headers
                .subject
                .as_ref()
                .map(|s| s.to_lowercase().contains(needle))
                .unwrap_or(false);
            let in_addresses = m
                .headers
                .from
                .iter()
                .chain(m.headers.to.iter())
                .any(|a| a.email.to_lowercase().contains(needle));
            if !in_subject && !in_addresses && !m.text.to_lowercase().contains(needle) {
                return false;
            }
        }
        true
    });

    // sort: receivedAt descending unless the client says otherwise
    let sort_spec = args
        .get("sort")
        .and_then(Value::as_array)
        .and_then(|s| s.first())
        .cloned()
        .unwrap_or(json!({"property": "receivedAt", "isAscending": false}));
    let property = sort_spec
        .get("property")
        .and_then(Value::as_str)
        .unwrap_or("receivedAt")
        .to_string();
    let ascending = sort_spec
        .get("isAscending")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    messages.sort_by(|a, b| {
        let ordering = match property.as_str() {
            "sentAt" => a.hdate.cmp(&b.hdate),
            "subject" => a
                .headers
                .subject
                .as_deref()
                .unwrap_or("")
                .to_lowercase()
                .cmp(&b.headers.subject.as_deref().unwrap_or("").to_lowercase()),
            "size" => a.size.cmp(&b.size),
            _ => a.idate.cmp(&b.idate),
        };
        match ascending {
            true => ordering,
            false => ordering.reverse(),
        }
    });

    let total = messages.len();
    let position = args
        .get("position")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let limit = args
        .get("limit")
        .and_then(Value::as_u64)
        .map(|l| l as usize)
        .unwrap_or(DEFAULT_QUERY_LIMIT)
        .min(MAX_QUERY_LIMIT);

    let ids: Vec<String> = messages
        .iter()
        .skip(position)
        .take(limit)
        .map(|m| m.id.to_string())
        .collect();

    let state = ctx
        .store
        .account_state(user)
        .await
        .map_err(account_state_error)?;
    Ok(json!({
        "accountId": user,
        "queryState": state.to_string(),
        "canCalculateChanges": false,
        "position": position,
        "total": total,
        "ids": ids,
    }))
}

pub async fn get(ctx: &JmapContext, user: &str, args: Value) -> MethodResult {
    let properties: Option<Vec<String>> = args.get("properties").and_then(Value::as_array).map(
        |props| {
            props
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        },
    );

    let mut list = Vec::new();
    let mut not_found: Vec<String> = Vec::new();
    match args.get("ids") {
        None | Some(Value::Null) => {
            for msg in all_messages(ctx, user).await? {
                list.push(email_json(&msg, properties.as_deref()));
            }
        }
        Some(Value::Array(ids)) => {
            for raw in ids.iter().filter_map(Value::as_str) {
                let id = match raw.parse::<MessageId>() {
                    Ok(id) => id,
                    Err(_) => {
                        not_found.push(raw.to_string());
                        continue;
                    }
                };
                match ctx
                    .store
                    .message(user, id)
                    .await
                    .map_err(MethodError::server_fail)?
                {
                    Some(msg) => list.push(email_json(&msg, properties.as_deref())),
                    None => not_found.push(raw.to_string()),
                }
            }
        }
        Some(_) => return Err(MethodError::invalid_arguments("ids must be an array")),
    }

    let state = ctx
        .store
        .account_state(user)
        .await
        .map_err(account_state_error)?;
    Ok(json!({
        "accountId": user,
        "state": state.to_string(),
        "list": list,
        "notFound": not_found,
    }))
}

fn email_json(msg: &Message, properties: Option<&[String]>) -> Value {
    let keywords: Map<String, Value> = msg
        .flags
        .iter()
        .filter_map(|f| flag_to_keyword(f))
        .map(|k| (k, Value::Bool(true)))
        .collect();
    let addresses = |list: &[missive_collections::mail::message::Address]| {
        Value::Array(
            list.iter()
                .map(|a| json!({"name": a.name, "email": a.email}))
                .collect(),
        )
    };

    let mut mailbox_ids = Map::new();
    mailbox_ids.insert(msg.mailbox.to_string(), Value::Bool(true));

    let mut body_values = Map::new();
    let mut text_body = Vec::new();
    let mut html_body = Vec::new();
    body_values.insert("1".to_string(), json!({"value": msg.text}));
    text_body.push(json!({"partId": "1", "type": "text/plain"}));
    if let Some(html) = &msg.html {
        body_values.insert("2".to_string(), json!({"value": html}));
        html_body.push(json!({"partId": "2", "type": "text/html"}));
    }

    let full = json!({
        "id": msg.id.to_string(),
        "threadId": msg.thread,
        "mailboxIds": mailbox_ids,
        "keywords": keywords,
        "size": msg.size,
        "receivedAt": msg.idate.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "sentAt": msg.hdate.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "subject": msg.headers.subject,
        "from": addresses(&msg.headers.from),
        "to": addresses(&msg.headers.to),
        "cc": addresses(&msg.headers.cc),
        "bcc": addresses(&msg.headers.bcc),
        "messageId": msg.headers.message_id.as_ref().map(|m| vec![m.clone()]),
        "inReplyTo": msg.headers.in_reply_to.as_ref().map(|m| vec![m.clone()]),
        "hasAttachment": !msg.attachments.is_empty(),
        "preview": msg.text.chars().take(200).collect::<String>(),
        "bodyValues": body_values,
        "textBody": text_body,
        "htmlBody": html_body,
    });

    match properties {
        None => full,
        Some(props) => {
            let mut out = Map::new();
            // id is always returned
            out.insert("id".to_string(), full["id"].clone());
            if let Value::Object(map) = full {
                for prop in props {
                    if let Some(value) = map.get(prop) {
                        out.insert(prop.clone(), value.clone());
                    }
                }
            }
            Value::Object(out)
        }
    }
}

pub async fn set(ctx: &JmapContext, user: &str, args: Value) -> MethodResult {
    let old_state = ctx
        .store
        .account_state(user)
        .await
        .map_err(account_state_error)?;

    // ifInState gates the whole batch before any mutation happens
    if let Some(expected) = args.get("ifInState").and_then(Value::as_str) {
        if expected != old_state.to_string() {
            return Err(MethodError::state_mismatch());
        }
    }

    let mut created = Map::new();
    let mut not_created = Map::new();
    if let Some(Value::Object(create)) = args.get("create") {
        for (cid, spec) in create {
            match create_one(ctx, user, spec).await {
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

    let mut updated = Map::new();
    let mut not_updated = Map::new();
    if let Some(Value::Object(update)) = args.get("update") {
        for (raw_id, patch) in update {
            match update_one(ctx, user, raw_id, patch).await {
                Ok(()) => {
                    updated.insert(raw_id.clone(), Value::Null);
                }
                Err(e) => {
                    not_updated.insert(
                        raw_id.clone(),
                        json!({"type": e.typ, "description": e.description}),
                    );
                }
            }
        }
    }

    let mut destroyed = Vec::new();
    let mut not_destroyed = Map::new();
    if let Some(Value::Array(destroy)) = args.get("destroy") {
        for raw_id in destroy.iter().filter_map(Value::as_str) {
            match destroy_one(ctx, user, raw_id).await {
                Ok(()) => destroyed.push(raw_id.to_string()),
                Err(e) => {
                    not_destroyed.insert(
                        raw_id.to_string(),
                        json!({"type": e.typ, "description": e.description}),
                    );
                }
            }
        }
    }

    let new_state = ctx
        .store
        .account_state(user)
        .await
        .map_err(account_state_error)?;
    Ok(json!({
        "accountId": user,
        "oldState": old_state.to_string(),
        "newState": new_state.to_string(),
        "created": created,
        "notCreated": not_created,
        "updated": updated,
        "notUpdated": not_updated,
        "destroyed": destroyed,
        "notDestroyed": not_destroyed,
    }))
}

/// Create a draft from its JMAP shape: target mailbox, keywords, headers
/// and a body value.
async fn create_one(ctx: &JmapContext, user: &str, spec: &Value) -> MethodResult {
    let mailbox = spec
        .get("mailboxIds")
        .and_then(Value::as_object)
        .and_then(|m| m.iter().find(|(_, v)| v.as_bool() == Some(true)))
        .map(|(k, _)| k.clone())
        .ok_or_else(|| MethodError::invalid_arguments("mailboxIds is required"))?
        .parse::<MailboxId>()
        .map_err(|_| MethodError::invalid_arguments("bad mailbox id"))?;

    let flags: Vec<String> = spec
        .get("keywords")
        .and_then(Value::as_object)
        .map(|kw| {
            kw.iter()
                .filter(|(_, v)| v.as_bool() == Some(true))
                .map(|(k, _)| keyword_to_flag(k))
                .collect()
        })
        .unwrap_or_default();

    let subject = spec.get("subject").and_then(Value::as_str).unwrap_or("");
    let render_addr = |field: &str| -> String {
        spec.get(field)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|a| a.get("email").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default()
    };
    let body = spec
        .get("bodyValues")
        .and_then(Value::as_object)
        .and_then(|bv| bv.values().next())
        .and_then(|part| part.get("value"))
        .and_then(Value::as_str)
        .unwrap_or("");

    let mut source = String::new();
    let from = render_addr("from");
    let to = render_addr("to");
    if !from.is_empty() {
        source.push_str(&format!("From: {}\r\n", from));
    }
    if !to.is_empty() {
        source.push_str(&format!("To: {}\r\n", to));
    }
    source.push_str(&format!("Subject: {}\r\n", subject));
    source.push_str(&format!(
        "Message-ID: <{}@missive>\r\n",
        uuid::Uuid::new_v4().simple()
    ));
    source.push_str(&format!("Date: {}\r\n", chrono::Utc::now().to_rfc2822()));
    source.push_str("\r\n");
    source.push_str(body);

    let appended = ctx
        .store
        .append_message(NewMessage {
            user: user.to_string(),
            mailbox,
            flags,
            idate: None,
            source: source.into_bytes(),
        })
        .await
        .map_err(|e| MethodError::invalid_arguments(e.to_string()))?;

    ctx.notifier
        .publish(
            user,
            vec![JournalEntry::new(
                mailbox,
                appended.modseq,
                JournalKind::Exists,
                appended.uid,
                appended.id,
                appended.flags.clone(),
            )],
            vec![(ChangeKind::Created, appended.id.to_string())],
        )
        .await
        .map_err(MethodError::server_fail)?;

    Ok(json!({"id": appended.id.to_string(), "size": appended.size}))
}

/// Update one message. A supplied `keywords` map REPLACES the whole
/// keyword set: a keyword absent from the map is cleared. `mailboxIds`
/// moves the message.
async fn update_one(
    ctx: &JmapContext,
    user: &str,
    raw_id: &str,
    patch: &Value,
) -> Result<(), MethodError> {
    let id = raw_id
        .parse::<MessageId>()
        .map_err(|_| MethodError::invalid_arguments("bad email id"))?;
    let msg = ctx
        .store
        .message(user, id)
        .await
        .map_err(MethodError::server_fail)?
        .ok_or(MethodError {
            typ: "notFound",
            description: None,
        })?;

    let mut journal = Vec::new();
    let mut changes = Vec::new();

    if let Some(Value::Object(keywords)) = patch.get("keywords") {
        let flags: Vec<String> = keywords
            .iter()
            .filter(|(_, v)| v.as_bool() == Some(true))
            .map(|(k, _)| keyword_to_flag(k))
            .collect();
        let updated = ctx
            .store
            .update_flags(user, id, FlagUpdate::Replace(flags))
            .await
            .map_err(MethodError::server_fail)?;
        journal.push(JournalEntry::new(
            updated.mailbox,
            updated.modseq,
            JournalKind::Fetch,
            updated.uid,
            id,
            updated.flags.clone(),
        ));
        changes.push((ChangeKind::Updated, raw_id.to_string()));
    } else {
        // the patch form: "keywords/$seen": true|null
        let mut add = Vec::new();
        let mut remove = Vec::new();
        if let Some(obj) = patch.as_object() {
            for (key, value) in obj {
                if let Some(keyword) = key.strip_prefix("keywords/") {
                    match value.as_bool() {
                        Some(true) => add.push(keyword_to_flag(keyword)),
                        _ => remove.push(keyword_to_flag(keyword)),
                    }
                }
            }
        }
        if !add.is_empty() || !remove.is_empty() {
            let mut latest = None;
            if !add.is_empty() {
                latest = Some(
                    ctx.store
                        .update_flags(user, id, FlagUpdate::Add(add))
                        .await
                        .map_err(MethodError::server_fail)?,
                );
            }
            if !remove.is_empty() {
                latest = Some(
                    ctx.store
                        .update_flags(user, id, FlagUpdate::Remove(remove))
                        .await
                        .map_err(MethodError::server_fail)?,
                );
            }
            if let Some(updated) = latest {
                journal.push(JournalEntry::new(
                    updated.mailbox,
                    updated.modseq,
                    JournalKind::Fetch,
                    updated.uid,
                    id,
                    updated.flags.clone(),
                ));
                changes.push((ChangeKind::Updated, raw_id.to_string()));
            }
        }
    }

    if let Some(Value::Object(mailbox_ids)) = patch.get("mailboxIds") {
        let target = mailbox_ids
            .iter()
            .find(|(_, v)| v.as_bool() == Some(true))
            .map(|(k, _)| k.clone())
            .ok_or_else(|| MethodError::invalid_arguments("mailboxIds must name a mailbox"))?
            .parse::<MailboxId>()
            .map_err(|_| MethodError::invalid_arguments("bad mailbox id"))?;
        if target != msg.mailbox {
            let moved = ctx
                .store
                .move_message(user, id, target)
                .await
                .map_err(MethodError::server_fail)?;
            journal.push(JournalEntry::new(
                msg.mailbox,
                moved.modseq,
                JournalKind::Expunge,
                msg.uid,
                id,
                vec![],
            ));
            journal.push(JournalEntry::new(
                target,
                moved.modseq,
                JournalKind::Exists,
                moved.uid,
                id,
                moved.flags.clone(),
            ));
            changes.push((ChangeKind::Updated, raw_id.to_string()));
        }
    }

    if !journal.is_empty() {
        ctx.notifier
            .publish(user, journal, changes)
            .await
            .map_err(MethodError::server_fail)?;
    }
    Ok(())
}

/// Destroy goes through the full message-delete path.
async fn destroy_one(ctx: &JmapContext, user: &str, raw_id: &str) -> Result<(), MethodError> {
    let id = raw_id
        .parse::<MessageId>()
        .map_err(|_| MethodError::invalid_arguments("bad email id"))?;
    let deleted = ctx
        .store
        .delete_message(user, id)
        .await
        .map_err(|_| MethodError {
            typ: "notFound",
            description: None,
        })?;
    ctx.notifier
        .publish(
            user,
            vec![JournalEntry::new(
                deleted.mailbox,
                deleted.modseq,
                JournalKind::Expunge,
                deleted.uid,
                id,
                vec![],
            )],
            vec![(ChangeKind::Destroyed, raw_id.to_string())],
        )
        .await
        .map_err(MethodError::server_fail)?;
    Ok(())
}

/// Email/changes delegates to the per-user change log; the log is the
/// single source of truth and there is no fallback computation.
pub async fn changes(ctx: &JmapContext, user: &str, args: Value) -> MethodResult {
    let since = args
        .get("sinceState")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(MethodError::cannot_calculate_changes)?;

    let changes = ctx
        .changelog
        .changes_since(user, since)
        .await
        .map_err(MethodError::server_fail)?;
    if changes.cannot_calculate {
        return Err(MethodError::cannot_calculate_changes());
    }
    Ok(json!({
        "accountId": user,
        "oldState": since.to_string(),
        "newState": changes.new_state.to_string(),
        "hasMoreChanges": false,
        "created": changes.created,
        "updated": changes.updated,
        "destroyed": changes.destroyed,
    }))
}
