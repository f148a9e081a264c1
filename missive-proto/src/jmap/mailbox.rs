use serde_json::{json, Map, Value};

use missive_collections::mail::mailbox::{Mailbox, SpecialUse, HIERARCHY_DELIMITER};
use missive_collections::mail::store::{MessageStore, StoreError};

use crate::jmap::dispatch::JmapContext;
use crate::jmap::types::{MethodError, MethodResult};

pub async fn get(ctx: &JmapContext, user: &str, args: Value) -> MethodResult {
    let mailboxes = ctx
        .store
        .list_mailboxes(user)
        .await
        .map_err(MethodError::server_fail)?;

    let wanted: Option<Vec<String>> = match args.get("ids") {
        None | Some(Value::Null) => None,
        Some(Value::Array(ids)) => Some(
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        Some(_) => return Err(MethodError::invalid_arguments("ids must be an array")),
    };

    let mut list = Vec::new();
    let mut not_found: Vec<String> = Vec::new();
    match wanted {
        None => {
            for mbx in &mailboxes {
                list.push(mailbox_json(ctx, user, mbx, &mailboxes).await?);
            }
        }
        Some(ids) => {
            for id in ids {
                match mailboxes.iter().find(|m| m.id.to_string() == id) {
                    Some(mbx) => list.push(mailbox_json(ctx, user, mbx, &mailboxes).await?),
                    None => not_found.push(id),
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
        "state": state.to_string(),
        "list": list,
        "notFound": not_found,
    }))
}

async fn mailbox_json(
    ctx: &JmapContext,
    user: &str,
    mbx: &Mailbox,
    all: &[Mailbox],
) -> Result<Value, MethodError> {
    let messages = ctx
        .store
        .messages_in(user, mbx.id)
        .await
        .map_err(MethodError::server_fail)?;
    let unread = messages.iter().filter(|m| m.unseen).count();
    let parent_id = mbx
        .parent()
        .and_then(|p| all.iter().find(|m| m.path == p))
        .map(|m| m.id.to_string());
    Ok(json!({
        "id": mbx.id.to_string(),
        "name": mbx.name(),
        "parentId": parent_id,
        "role": mbx.special_use.as_role(),
        "sortOrder": 0,
        "totalEmails": messages.len(),
        "unreadEmails": unread,
        "isSubscribed": mbx.subscribed,
    }))
}

/// Mailbox/set supports creation only; updates and destroys are refused.
pub async fn set(ctx: &JmapContext, user: &str, args: Value) -> MethodResult {
    let old_state = ctx
        .store
        .account_state(user)
        .await
        .map_err(MethodError::server_fail)?;
    if let Some(expected) = args.get("ifInState").and_then(Value::as_str) {
        if expected != old_state.to_string() {
            return Err(MethodError::state_mismatch());
        }
    }

    let mailboxes = ctx
        .store
        .list_mailboxes(user)
        .await
        .map_err(MethodError::server_fail)?;

    let mut created = Map::new();
    let mut not_created = Map::new();
    if let Some(Value::Object(create)) = args.get("create") {
        for (cid, spec) in create {
            let name = match spec.get("name").and_then(Value::as_str) {
                Some(name) if !name.is_empty() => name,
                _ => {
                    not_created.insert(
                        cid.clone(),
                        json!({"type": "invalidProperties", "description": "name is required"}),
                    );
                    continue;
                }
            };
            let path = match spec.get("parentId").and_then(Value::as_str) {
                None => name.to_string(),
                Some(parent_id) => {
                    match mailboxes.iter().find(|m| m.id.to_string() == parent_id) {
                        Some(parent) => {
                            format!("{}{}{}", parent.path, HIERARCHY_DELIMITER, name)
                        }
                        None => {
                            not_created.insert(
                                cid.clone(),
                                json!({"type": "notFound", "description": "parent mailbox"}),
                            );
                            continue;
                        }
                    }
                }
            };
            match ctx
                .store
                .create_mailbox(user, &path, SpecialUse::None)
                .await
            {
                Ok(mbx) => {
                    created.insert(cid.clone(), json!({"id": mbx.id.to_string()}));
                }
                Err(StoreError::AlreadyExists) => {
                    not_created.insert(
                        cid.clone(),
                        json!({"type": "invalidProperties", "description": "mailbox exists"}),
                    );
                }
                Err(e) => {
                    not_created.insert(
                        cid.clone(),
                        json!({"type": "serverFail", "description": e.to_string()}),
                    );
                }
            }
        }
    }

    let mut not_updated = Map::new();
    if let Some(Value::Object(update)) = args.get("update") {
        for (id, _) in update {
            not_updated.insert(id.clone(), json!({"type": "forbidden"}));
        }
    }
    let mut not_destroyed = Map::new();
    if let Some(Value::Array(destroy)) = args.get("destroy") {
        for id in destroy.iter().filter_map(Value::as_str) {
            not_destroyed.insert(id.to_string(), json!({"type": "forbidden"}));
        }
    }

    let new_state = ctx
        .store
        .account_state(user)
        .await
        .map_err(MethodError::server_fail)?;
    Ok(json!({
        "accountId": user,
        "oldState": old_state.to_string(),
        "newState": new_state.to_string(),
        "created": created,
        "notCreated": not_created,
        "updated": {},
        "notUpdated": not_updated,
        "destroyed": [],
        "notDestroyed": not_destroyed,
    }))
}
