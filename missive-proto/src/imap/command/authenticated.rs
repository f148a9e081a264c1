use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use missive_codec::imap::response::{Code, Data};
use missive_codec::imap::types::{Command, CommandBody, Flag, MailboxName, StatusItem};
use missive_collections::changelog::ChangeKind;
use missive_collections::mail::journal::{JournalEntry, JournalKind};
use missive_collections::mail::mailbox::{Mailbox, SpecialUse};
use missive_collections::mail::store::{ArcMessageStore, MessageStore, NewMessage, StoreError};
use missive_collections::notifier::Notifier;

use crate::imap::capability::{ClientCapability, ServerCapability};
use crate::imap::command::{anystate, mailbox_pattern_matches};
use crate::imap::flow;
use crate::imap::mailbox_view::MailboxView;
use crate::imap::response::Response;

pub struct AuthenticatedContext<'a> {
    pub req: &'a Command,
    pub server_capabilities: &'a ServerCapability,
    pub client_capabilities: &'a mut ClientCapability,
    pub user: &'a Arc<flow::User>,
    pub store: &'a ArcMessageStore,
    pub notifier: &'a Arc<Notifier>,
}

pub async fn dispatch(ctx: AuthenticatedContext<'_>) -> Result<(Response, flow::Transition)> {
    match &ctx.req.body {
        // Any state
        CommandBody::Noop => anystate::noop_nothing(ctx.req.tag.clone()),
        CommandBody::Capability => {
            anystate::capability(ctx.req.tag.clone(), ctx.server_capabilities)
        }
        CommandBody::Logout => anystate::logout(ctx.req.tag.clone()),
        CommandBody::Id { .. } => anystate::id(ctx.req.tag.clone()),

        // Specific to this state
        CommandBody::Select { mailbox, condstore } => {
            ctx.select(mailbox, *condstore, flow::MailboxPerm::ReadWrite)
                .await
        }
        CommandBody::Examine { mailbox, condstore } => {
            ctx.select(mailbox, *condstore, flow::MailboxPerm::ReadOnly)
                .await
        }
        CommandBody::Create { mailbox } => ctx.create(mailbox).await,
        CommandBody::Delete { mailbox } => ctx.delete(mailbox).await,
        CommandBody::Rename { from, to } => ctx.rename(from, to).await,
        CommandBody::Subscribe { mailbox } => ctx.subscribe(mailbox, true).await,
        CommandBody::Unsubscribe { mailbox } => ctx.subscribe(mailbox, false).await,
        CommandBody::List { reference, pattern } => ctx.list(reference, pattern, false).await,
        CommandBody::Lsub { reference, pattern } => ctx.list(reference, pattern, true).await,
        CommandBody::Status { mailbox, items } => ctx.status(mailbox, items).await,
        CommandBody::Append {
            mailbox,
            flags,
            date,
            message,
        } => ctx.append(mailbox, flags, date, message).await,
        CommandBody::Enable { capabilities } => ctx.enable(capabilities),
        CommandBody::Namespace => ctx.namespace(),
        CommandBody::Compress { algorithm } => ctx.compress(algorithm),

        // IDLE needs a selected mailbox; the connection loop intercepts it
        // there, so reaching this point means the state is wrong.
        CommandBody::Idle => Ok((
            Response::build()
                .to_req(ctx.req)
                .message("IDLE requires a selected mailbox")
                .bad()?,
            flow::Transition::None,
        )),

        // Already authenticated
        CommandBody::Login { .. } | CommandBody::Authenticate { .. } | CommandBody::StartTls => {
            anystate::wrong_state(ctx.req.tag.clone())
        }

        // Selected-state commands without a selection
        _ => Ok((
            Response::build()
                .to_req(ctx.req)
                .message("No mailbox selected")
                .bad()?,
            flow::Transition::None,
        )),
    }
}

impl<'a> AuthenticatedContext<'a> {
    async fn select(
        self,
        mailbox: &MailboxName,
        condstore: bool,
        perm: flow::MailboxPerm,
    ) -> Result<(Response, flow::Transition)> {
        let mbx = match self
            .store
            .mailbox_by_path(&self.user.username, mailbox.as_str())
            .await?
        {
            Some(mbx) => mbx,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Mailbox does not exist")
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };
        if condstore {
            self.client_capabilities.enable_condstore();
        }
        let is_condstore = self.client_capabilities.condstore.is_enabled();

        let view = MailboxView::open(
            self.store.clone(),
            self.notifier.clone(),
            &self.user.username,
            mbx,
            is_condstore,
        )
        .await?;
        let summary = view.summary();

        let (code, verb) = match perm {
            flow::MailboxPerm::ReadWrite => (Code::ReadWrite, "SELECT"),
            flow::MailboxPerm::ReadOnly => (Code::ReadOnly, "EXAMINE"),
        };
        Ok((
            Response::build()
                .to_req(self.req)
                .message(format!("{} completed", verb))
                .code(code)
                .set_body(summary)
                .ok()?,
            flow::Transition::Select(view, perm),
        ))
    }

    async fn create(self, mailbox: &MailboxName) -> Result<(Response, flow::Transition)> {
        match self
            .store
            .create_mailbox(&self.user.username, mailbox.as_str(), SpecialUse::None)
            .await
        {
            Ok(_) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("CREATE completed")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(StoreError::AlreadyExists) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("Mailbox already exists")
                    .no()?,
                flow::Transition::None,
            )),
            Err(StoreError::Invalid(why)) => Ok((
                Response::build().to_req(self.req).message(why).no()?,
                flow::Transition::None,
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(self, mailbox: &MailboxName) -> Result<(Response, flow::Transition)> {
        let mbx = match self
            .store
            .mailbox_by_path(&self.user.username, mailbox.as_str())
            .await?
        {
            Some(mbx) => mbx,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Mailbox does not exist")
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };
        match self.store.delete_mailbox(&self.user.username, mbx.id).await {
            Ok(()) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("DELETE completed")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(StoreError::Invalid(why)) => Ok((
                Response::build().to_req(self.req).message(why).no()?,
                flow::Transition::None,
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename(
        self,
        from: &MailboxName,
        to: &MailboxName,
    ) -> Result<(Response, flow::Transition)> {
        if from.as_str() == "INBOX" {
            return Ok((
                Response::build()
                    .to_req(self.req)
                    .message("INBOX can not be renamed")
                    .no()?,
                flow::Transition::None,
            ));
        }
        let mbx = match self
            .store
            .mailbox_by_path(&self.user.username, from.as_str())
            .await?
        {
            Some(mbx) => mbx,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Mailbox does not exist")
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };
        match self
            .store
            .rename_mailbox(&self.user.username, mbx.id, to.as_str())
            .await
        {
            Ok(()) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("RENAME completed")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(StoreError::AlreadyExists) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("Target mailbox already exists")
                    .no()?,
                flow::Transition::None,
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn subscribe(
        self,
        mailbox: &MailboxName,
        subscribed: bool,
    ) -> Result<(Response, flow::Transition)> {
        match self
            .store
            .set_subscribed(&self.user.username, mailbox.as_str(), subscribed)
            .await
        {
            Ok(()) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("Completed")
                    .ok()?,
                flow::Transition::None,
            )),
            Err(StoreError::NotFound) => Ok((
                Response::build()
                    .to_req(self.req)
                    .message("Mailbox does not exist")
                    .no()?,
                flow::Transition::None,
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        self,
        reference: &str,
        pattern: &str,
        subscribed_only: bool,
    ) -> Result<(Response, flow::Transition)> {
        // empty pattern: the client asks for the hierarchy delimiter
        if pattern.is_empty() {
            return Ok((
                Response::build()
                    .to_req(self.req)
                    .message("LIST completed")
                    .data(Data::List {
                        attributes: vec!["\\Noselect".to_string()],
                        delimiter: '/',
                        name: String::new(),
                    })
                    .ok()?,
                flow::Transition::None,
            ));
        }

        let full_pattern = format!("{}{}", reference, pattern);
        let mailboxes = self.store.list_mailboxes(&self.user.username).await?;
        let mut body = Vec::new();
        for mbx in &mailboxes {
            if subscribed_only && !mbx.subscribed {
                continue;
            }
            if !mailbox_pattern_matches(&full_pattern, &mbx.path) {
                continue;
            }
            let attributes = list_attributes(mbx, &mailboxes);
            let data = match subscribed_only {
                false => Data::List {
                    attributes,
                    delimiter: '/',
                    name: mbx.path.clone(),
                },
                true => Data::Lsub {
                    attributes,
                    delimiter: '/',
                    name: mbx.path.clone(),
                },
            };
            body.push(crate::imap::response::Body::Data(data));
        }
        Ok((
            Response::build()
                .to_req(self.req)
                .message("LIST completed")
                .set_body(body)
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn status(
        self,
        mailbox: &MailboxName,
        items: &[StatusItem],
    ) -> Result<(Response, flow::Transition)> {
        let mbx = match self
            .store
            .mailbox_by_path(&self.user.username, mailbox.as_str())
            .await?
        {
            Some(mbx) => mbx,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Mailbox does not exist")
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };
        let messages = self
            .store
            .messages_in(&self.user.username, mbx.id)
            .await?;

        let values = items
            .iter()
            .map(|item| {
                let value = match item {
                    StatusItem::Messages => messages.len() as u64,
                    StatusItem::Recent => messages
                        .iter()
                        .filter(|m| m.has_flag("\\Recent"))
                        .count() as u64,
                    StatusItem::Unseen => messages.iter().filter(|m| m.unseen).count() as u64,
                    StatusItem::UidNext => mbx.uid_next as u64,
                    StatusItem::UidValidity => mbx.uid_validity as u64,
                    StatusItem::HighestModSeq => messages
                        .iter()
                        .map(|m| m.modseq)
                        .max()
                        .unwrap_or(0)
                        .max(mbx.modify_index)
                        .max(1),
                };
                (*item, value)
            })
            .collect();

        Ok((
            Response::build()
                .to_req(self.req)
                .message("STATUS completed")
                .data(Data::Status {
                    mailbox: mbx.path.clone(),
                    items: values,
                })
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn append(
        self,
        mailbox: &MailboxName,
        flags: &[Flag],
        date: &Option<chrono::DateTime<chrono::FixedOffset>>,
        message: &[u8],
    ) -> Result<(Response, flow::Transition)> {
        let mbx = match self
            .store
            .mailbox_by_path(&self.user.username, mailbox.as_str())
            .await?
        {
            Some(mbx) => mbx,
            None => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Mailbox does not exist")
                        .code(Code::TryCreate)
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };

        let mut flag_strings: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
        flag_strings.push("\\Recent".to_string());
        let appended = self
            .store
            .append_message(NewMessage {
                user: self.user.username.clone(),
                mailbox: mbx.id,
                flags: flag_strings,
                idate: date.map(|d| d.with_timezone(&Utc)),
                source: message.to_vec(),
            })
            .await?;

        self.notifier
            .publish(
                &self.user.username,
                vec![JournalEntry::new(
                    mbx.id,
                    appended.modseq,
                    JournalKind::Exists,
                    appended.uid,
                    appended.id,
                    appended.flags.clone(),
                )],
                vec![(ChangeKind::Created, appended.id.to_string())],
            )
            .await?;

        Ok((
            Response::build()
                .to_req(self.req)
                .message("APPEND completed")
                .code(Code::AppendUid(mbx.uid_validity, appended.uid))
                .ok()?,
            flow::Transition::None,
        ))
    }

    fn enable(self, capabilities: &[String]) -> Result<(Response, flow::Transition)> {
        let enabled = self.client_capabilities.try_enable(capabilities);
        Ok((
            Response::build()
                .to_req(self.req)
                .message("ENABLE completed")
                .data(Data::Enabled(enabled))
                .ok()?,
            flow::Transition::None,
        ))
    }

    fn namespace(self) -> Result<(Response, flow::Transition)> {
        Ok((
            Response::build()
                .to_req(self.req)
                .message("NAMESPACE completed")
                .data(Data::Namespace)
                .ok()?,
            flow::Transition::None,
        ))
    }

    /// Validation only. When this succeeds, the connection loop swaps the
    /// actual byte pipelines after the OK has been written out.
    fn compress(self, algorithm: &str) -> Result<(Response, flow::Transition)> {
        if !algorithm.eq_ignore_ascii_case("DEFLATE") {
            return Ok((
                Response::build()
                    .to_req(self.req)
                    .message("Unsupported compression algorithm")
                    .no()?,
                flow::Transition::None,
            ));
        }
        Ok((
            Response::build()
                .to_req(self.req)
                .message("DEFLATE active")
                .ok()?,
            flow::Transition::None,
        ))
    }
}

fn list_attributes(mbx: &Mailbox, all: &[Mailbox]) -> Vec<String> {
    let mut attributes = Vec::new();
    let child_prefix = format!("{}/", mbx.path);
    match all.iter().any(|m| m.path.starts_with(&child_prefix)) {
        true => attributes.push("\\HasChildren".to_string()),
        false => attributes.push("\\HasNoChildren".to_string()),
    }
    if let Some(special) = mbx.special_use.as_attribute() {
        attributes.push(special.to_string());
    }
    attributes
}
