use std::sync::Arc;

use serde_json::{json, Value};

use missive_collections::blob::BlobFacade;
use missive_collections::changelog::ChangeLog;
use missive_collections::mail::store::{ArcMessageStore, MessageStore};
use missive_collections::notifier::Notifier;
use missive_collections::submitter::ArcSubmitter;

use crate::jmap::types::{resolve_backrefs, JmapRequest, JmapResponse, MethodCall, MethodResult};
use crate::jmap::{email, mailbox, submission};

/// Everything the method handlers need.
#[derive(Clone)]
pub struct JmapContext {
    pub store: ArcMessageStore,
    pub changelog: Arc<ChangeLog>,
    pub notifier: Arc<Notifier>,
    pub blobs: BlobFacade,
    pub submitter: ArcSubmitter,
}

/// Run one API request: per-call back-reference substitution, dispatch,
/// and per-call error encapsulation. A failing call never aborts the
/// batch; it answers as `["error", …]` in its slot.
pub async fn handle_request(ctx: &JmapContext, user: &str, request: JmapRequest) -> JmapResponse {
    let mut responses: Vec<Value> = Vec::with_capacity(request.method_calls.len());
    for MethodCall(name, mut args, call_id) in request.method_calls {
        tracing::debug!(user, method = %name, call = %call_id, "jmap method call");
        let result = match resolve_backrefs(&mut args, &responses) {
            Err(e) => Err(e),
            Ok(()) => dispatch(ctx, user, &name, args).await,
        };
        let response = match result {
            Ok(value) => json!([name, value, call_id]),
            Err(e) => json!([
                "error",
                {"type": e.typ, "description": e.description},
                call_id
            ]),
        };
        responses.push(response);
    }

    let session_state = ctx
        .store
        .account_state(user)
        .await
        .unwrap_or(1)
        .to_string();
    JmapResponse {
        method_responses: responses,
        session_state,
    }
}

async fn dispatch(ctx: &JmapContext, user: &str, name: &str, args: Value) -> MethodResult {
    match name {
        "Mailbox/get" => mailbox::get(ctx, user, args).await,
        "Mailbox/set" => mailbox::set(ctx, user, args).await,
        "Email/query" => email::query(ctx, user, args).await,
        "Email/get" => email::get(ctx, user, args).await,
        "Email/set" => email::set(ctx, user, args).await,
        "Email/changes" => email::changes(ctx, user, args).await,
        "EmailSubmission/set" => submission::set(ctx, user, args).await,
        _ => Err(crate::jmap::types::MethodError::unknown_method()),
    }
}
