use std::sync::Arc;

use anyhow::Result;

use missive_codec::imap::response::Code;
use missive_codec::imap::search::SearchKey;
use missive_codec::imap::sequence::SequenceSet;
use missive_codec::imap::types::{
    Command, CommandBody, FetchItem, FetchItems, Flag, MailboxName, StoreAction, StoreResponse,
};
use missive_collections::mail::store::{ArcMessageStore, MessageStore};
use missive_collections::notifier::Notifier;

use crate::imap::capability::{ClientCapability, ServerCapability};
use crate::imap::command::{anystate, authenticated};
use crate::imap::flow;
use crate::imap::mailbox_view::{MailboxView, UpdateParameters};
use crate::imap::response::Response;

pub struct SelectedContext<'a> {
    pub req: &'a Command,
    pub server_capabilities: &'a ServerCapability,
    pub client_capabilities: &'a mut ClientCapability,
    pub user: &'a Arc<flow::User>,
    pub store: &'a ArcMessageStore,
    pub notifier: &'a Arc<Notifier>,
    pub mailbox: &'a mut MailboxView,
    pub perm: &'a flow::MailboxPerm,
}

pub async fn dispatch(ctx: SelectedContext<'_>) -> Result<(Response, flow::Transition)> {
    match &ctx.req.body {
        // Any state
        CommandBody::Capability => {
            anystate::capability(ctx.req.tag.clone(), ctx.server_capabilities)
        }
        CommandBody::Logout => anystate::logout(ctx.req.tag.clone()),

        // Specific to this state
        CommandBody::Close => match ctx.perm {
            flow::MailboxPerm::ReadWrite => ctx.close().await,
            flow::MailboxPerm::ReadOnly => ctx.examine_close().await,
        },
        CommandBody::Unselect => ctx.unselect().await,
        CommandBody::Noop | CommandBody::Check => ctx.noop().await,
        CommandBody::Fetch {
            sequence_set,
            items,
            changed_since,
            uid,
        } => ctx.fetch(sequence_set, items, *changed_since, *uid).await,
        CommandBody::Search { criteria, uid } => ctx.search(criteria, *uid).await,
        CommandBody::Expunge { uid_sequence_set } => ctx.expunge(uid_sequence_set).await,
        CommandBody::Store {
            sequence_set,
            action,
            response,
            flags,
            unchanged_since,
            uid,
        } => {
            ctx.store(sequence_set, *action, *response, flags, *unchanged_since, *uid)
                .await
        }
        CommandBody::Copy {
            sequence_set,
            mailbox,
            uid,
        } => ctx.copy(sequence_set, mailbox, *uid).await,
        CommandBody::Move {
            sequence_set,
            mailbox,
            uid,
        } => ctx.r#move(sequence_set, mailbox, *uid).await,

        // In selected mode we fall back to authenticated when needed
        _ => {
            authenticated::dispatch(authenticated::AuthenticatedContext {
                req: ctx.req,
                server_capabilities: ctx.server_capabilities,
                client_capabilities: ctx.client_capabilities,
                user: ctx.user,
                store: ctx.store,
                notifier: ctx.notifier,
            })
            .await
        }
    }
}

impl<'a> SelectedContext<'a> {
    /// CLOSE expunges silently, then drops the selection.
    async fn close(self) -> Result<(Response, flow::Transition)> {
        let tag = self.req.tag.clone();
        self.mailbox.expunge(&None).await?;
        Ok((
            Response::build().tag(tag.0).message("CLOSE completed").ok()?,
            flow::Transition::Unselect,
        ))
    }

    /// CLOSE on an EXAMINEd mailbox does not expunge.
    async fn examine_close(self) -> Result<(Response, flow::Transition)> {
        Ok((
            Response::build()
                .to_req(self.req)
                .message("CLOSE completed")
                .ok()?,
            flow::Transition::Unselect,
        ))
    }

    async fn unselect(self) -> Result<(Response, flow::Transition)> {
        Ok((
            Response::build()
                .to_req(self.req)
                .message("UNSELECT completed")
                .ok()?,
            flow::Transition::Unselect,
        ))
    }

    async fn noop(self) -> Result<(Response, flow::Transition)> {
        let updates = self.mailbox.update(UpdateParameters::default()).await?;
        Ok((
            Response::build()
                .to_req(self.req)
                .message("NOOP completed")
                .set_body(updates)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn fetch(
        self,
        sequence_set: &SequenceSet,
        items: &FetchItems,
        changed_since: Option<u64>,
        uid: bool,
    ) -> Result<(Response, flow::Transition)> {
        // CHANGEDSINCE or a MODSEQ data item implicitly enables CONDSTORE
        if changed_since.is_some()
            || matches!(items, FetchItems::Items(list) if list.contains(&FetchItem::ModSeq))
        {
            self.client_capabilities.enable_condstore();
        }

        match self
            .mailbox
            .fetch(sequence_set, items, changed_since, uid)
            .await
        {
            Ok(resp) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("FETCH completed")
                    .set_body(resp)
                    .ok()?,
                flow::Transition::None,
            )),
            Err(e) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message(e.to_string())
                    .no()?,
                flow::Transition::None,
            )),
        }
    }

    async fn search(
        self,
        criteria: &[SearchKey],
        uid: bool,
    ) -> Result<(Response, flow::Transition)> {
        let (found, used_modseq) = self.mailbox.search(criteria, uid).await?;
        if used_modseq {
            self.client_capabilities.enable_condstore();
        }
        Ok((
            Response::build()
                .to_req(self.req)
                .set_body(found)
                .message("SEARCH completed")
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn expunge(
        self,
        uid_sequence_set: &Option<SequenceSet>,
    ) -> Result<(Response, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }
        let tag = self.req.tag.clone();
        let data = self.mailbox.expunge(uid_sequence_set).await?;
        Ok((
            Response::build()
                .tag(tag.0)
                .message("EXPUNGE completed")
                .set_body(data)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn store(
        self,
        sequence_set: &SequenceSet,
        action: StoreAction,
        response: StoreResponse,
        flags: &[Flag],
        unchanged_since: Option<u64>,
        uid: bool,
    ) -> Result<(Response, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }
        if unchanged_since.is_some() {
            self.client_capabilities.enable_condstore();
        }

        let (data, modified) = self
            .mailbox
            .store_flags(sequence_set, action, response, flags, unchanged_since, uid)
            .await?;

        let mut ok_resp = Response::build()
            .to_req(self.req)
            .message("STORE completed")
            .set_body(data);
        if !modified.is_empty() {
            let set = modified
                .iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(",");
            ok_resp = ok_resp.code(Code::Modified(set));
        }

        Ok((ok_resp.ok()?, flow::Transition::None))
    }

    async fn copy(
        self,
        sequence_set: &SequenceSet,
        mailbox: &MailboxName,
        uid: bool,
    ) -> Result<(Response, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }
        let target = match self
            .store
            .mailbox_by_path(&self.user.username, mailbox.as_str())
            .await?
        {
            Some(target) => target,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Destination mailbox does not exist")
                        .code(Code::TryCreate)
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };

        let (uidval, uid_map) = self.mailbox.copy_to(sequence_set, &target, uid).await?;
        let (sources, targets) = uid_map_strings(&uid_map);
        Ok((
            Response::build()
                .to_req(self.req)
                .message("COPY completed")
                .code(Code::CopyUid(uidval, sources, targets))
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn r#move(
        self,
        sequence_set: &SequenceSet,
        mailbox: &MailboxName,
        uid: bool,
    ) -> Result<(Response, flow::Transition)> {
        if let Some(failed) = self.fail_read_only() {
            return Ok((failed, flow::Transition::None));
        }
        let target = match self
            .store
            .mailbox_by_path(&self.user.username, mailbox.as_str())
            .await?
        {
            Some(target) => target,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Destination mailbox does not exist")
                        .code(Code::TryCreate)
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };

        let (uidval, uid_map, data) = self.mailbox.move_to(sequence_set, &target, uid).await?;
        let (sources, targets) = uid_map_strings(&uid_map);
        Ok((
            Response::build()
                .to_req(self.req)
                .message("MOVE completed")
                .code(Code::CopyUid(uidval, sources, targets))
                .set_body(data)
                .ok()?,
            flow::Transition::None,
        ))
    }

    fn fail_read_only(&self) -> Option<Response> {
        match self.perm {
            flow::MailboxPerm::ReadWrite => None,
            flow::MailboxPerm::ReadOnly => Some(
                Response::build()
                    .to_req(self.req)
                    .message("Write commands are forbidden while examining a mailbox")
                    .no()
                    .expect("valid response"),
            ),
        }
    }
}

fn uid_map_strings(uid_map: &[(u32, u32)]) -> (String, String) {
    (
        uid_map
            .iter()
            .map(|(src, _)| src.to_string())
            .collect::<Vec<_>>()
            .join(","),
        uid_map
            .iter()
            .map(|(_, dst)| dst.to_string())
            .collect::<Vec<_>>()
            .join(","),
    )
}
