use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use missive_codec::imap::types::{Command, CommandBody};
use missive_collections::mail::store::{ArcMessageStore, MessageStore};
use missive_user::login::{ArcLoginProvider, LoginProvider};

use crate::imap::capability::ServerCapability;
use crate::imap::command::anystate;
use crate::imap::flow;
use crate::imap::response::Response;

pub struct AnonymousContext<'a> {
    pub req: &'a Command,
    pub server_capabilities: &'a ServerCapability,
    pub login_provider: &'a ArcLoginProvider,
    pub store: &'a ArcMessageStore,
    pub starttls_available: bool,
}

pub async fn dispatch(ctx: AnonymousContext<'_>) -> Result<(Response, flow::Transition)> {
    match &ctx.req.body {
        // Any state
        CommandBody::Noop => anystate::noop_nothing(ctx.req.tag.clone()),
        CommandBody::Capability => {
            anystate::capability(ctx.req.tag.clone(), ctx.server_capabilities)
        }
        CommandBody::Logout => anystate::logout(ctx.req.tag.clone()),
        CommandBody::Id { .. } => anystate::id(ctx.req.tag.clone()),

        // Specific to not-authenticated
        CommandBody::StartTls => ctx.starttls(),
        CommandBody::Login { username, password } => ctx.login(username, password).await,
        CommandBody::Authenticate {
            mechanism,
            initial_response,
        } => {
            ctx.authenticate(mechanism, initial_response.as_deref())
                .await
        }

        // The rest needs authentication
        _ => anystate::wrong_state(ctx.req.tag.clone()),
    }
}

impl<'a> AnonymousContext<'a> {
    fn starttls(self) -> Result<(Response, flow::Transition)> {
        if !self.starttls_available {
            return Ok((
                Response::build()
                    .to_req(self.req)
                    .message("TLS is not available on this listener")
                    .no()?,
                flow::Transition::None,
            ));
        }
        Ok((
            Response::build()
                .to_req(self.req)
                .message("Begin TLS negotiation now")
                .ok()?,
            flow::Transition::None,
        ))
    }

    async fn login(self, username: &str, password: &str) -> Result<(Response, flow::Transition)> {
        tracing::info!(user = username, "command.login");
        self.credentials_check(username, password).await
    }

    /// AUTHENTICATE, with the initial response either inlined (SASL-IR)
    /// or gathered by the connection loop through a continuation round.
    async fn authenticate(
        self,
        mechanism: &str,
        initial_response: Option<&[u8]>,
    ) -> Result<(Response, flow::Transition)> {
        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            return Ok((
                Response::build()
                    .to_req(self.req)
                    .message("Unsupported authentication mechanism")
                    .no()?,
                flow::Transition::None,
            ));
        }
        let payload = match initial_response {
            // "=" is the empty initial response
            Some(raw) if !raw.is_empty() && raw != b"=" => raw,
            _ => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Empty SASL PLAIN payload")
                        .no()?,
                    flow::Transition::None,
                ))
            }
        };
        let decoded = match STANDARD.decode(payload) {
            Ok(bytes) => bytes,
            Err(_) => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Invalid base64 in SASL payload")
                        .bad()?,
                    flow::Transition::None,
                ))
            }
        };
        // message = [authzid] NUL authcid NUL passwd
        let mut parts = decoded.split(|&b| b == 0);
        let (_authzid, authcid, passwd) = match (parts.next(), parts.next(), parts.next()) {
            (Some(z), Some(c), Some(p)) if parts.next().is_none() => (z, c, p),
            _ => {
                return Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Malformed SASL PLAIN message")
                        .bad()?,
                    flow::Transition::None,
                ))
            }
        };
        let username = String::from_utf8_lossy(authcid).into_owned();
        let password = String::from_utf8_lossy(passwd).into_owned();
        self.credentials_check(&username, &password).await
    }

    async fn credentials_check(
        self,
        username: &str,
        password: &str,
    ) -> Result<(Response, flow::Transition)> {
        match self.login_provider.login(username, password).await {
            Ok(creds) => {
                self.store.ensure_user(username).await?;
                let user = Arc::new(flow::User::from(creds));
                Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Completed")
                        .ok()?,
                    flow::Transition::Authenticate(user),
                ))
            }
            Err(e) => {
                tracing::debug!(user = username, err = %e, "authentication failed");
                Ok((
                    Response::build()
                        .to_req(self.req)
                        .message("Invalid credentials")
                        .no()?,
                    flow::Transition::None,
                ))
            }
        }
    }
}
