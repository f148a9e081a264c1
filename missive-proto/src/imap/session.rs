use std::sync::Arc;

use missive_codec::imap::types::Command;
use missive_collections::mail::store::ArcMessageStore;
use missive_collections::notifier::Notifier;
use missive_user::login::ArcLoginProvider;

use crate::imap::capability::{ClientCapability, ServerCapability};
use crate::imap::command::{anonymous, authenticated, selected};
use crate::imap::flow;
use crate::imap::mailbox_view::MailboxView;
use crate::imap::response::Response;

/// One connection's protocol state machine, independent of any I/O.
pub struct Instance {
    pub login_provider: ArcLoginProvider,
    pub store: ArcMessageStore,
    pub notifier: Arc<Notifier>,
    pub server_capabilities: ServerCapability,
    pub client_capabilities: ClientCapability,
    pub state: flow::State,
    pub starttls_available: bool,
}

impl Instance {
    pub fn new(
        login_provider: ArcLoginProvider,
        store: ArcMessageStore,
        notifier: Arc<Notifier>,
        server_capabilities: ServerCapability,
        starttls_available: bool,
    ) -> Self {
        let client_capabilities = ClientCapability::new(&server_capabilities);
        Self {
            login_provider,
            store,
            notifier,
            server_capabilities,
            client_capabilities,
            state: flow::State::NotAuthenticated,
            starttls_available,
        }
    }

    /// Dispatch one command in the current state, apply the resulting
    /// transition, and hand back the response.
    ///
    /// Command behavior is modulated by the state, so each state gets its
    /// own dispatch path; handler errors never leave this function as
    /// anything but a BAD.
    pub async fn command(&mut self, cmd: Command) -> Response {
        let (resp, transition) = match &mut self.state {
            flow::State::NotAuthenticated => {
                let ctx = anonymous::AnonymousContext {
                    req: &cmd,
                    server_capabilities: &self.server_capabilities,
                    login_provider: &self.login_provider,
                    store: &self.store,
                    starttls_available: self.starttls_available,
                };
                anonymous::dispatch(ctx).await
            }
            flow::State::Authenticated(ref user) => {
                let ctx = authenticated::AuthenticatedContext {
                    req: &cmd,
                    server_capabilities: &self.server_capabilities,
                    client_capabilities: &mut self.client_capabilities,
                    user,
                    store: &self.store,
                    notifier: &self.notifier,
                };
                authenticated::dispatch(ctx).await
            }
            flow::State::Selected(ref user, ref mut mailbox, ref perm) => {
                let ctx = selected::SelectedContext {
                    req: &cmd,
                    server_capabilities: &self.server_capabilities,
                    client_capabilities: &mut self.client_capabilities,
                    user,
                    store: &self.store,
                    notifier: &self.notifier,
                    mailbox,
                    perm,
                };
                selected::dispatch(ctx).await
            }
            flow::State::Logout => Response::build()
                .to_req(&cmd)
                .message("No commands are allowed in the LOGOUT state")
                .bad()
                .map(|r| (r, flow::Transition::None)),
        }
        .unwrap_or_else(|err| {
            tracing::error!(err = ?err, cmd = cmd.body.name(), "error while processing command");
            (
                Response::build()
                    .to_req(&cmd)
                    .message("Internal error while processing command")
                    .bad()
                    .expect("valid response"),
                flow::Transition::None,
            )
        });

        if let Err(e) = self.state.apply(transition) {
            tracing::error!(err = ?e, cmd = cmd.body.name(), "illegal IMAP state transition");
            return Response::build()
                .to_req(&cmd)
                .message("Internal error, command triggered an illegal state transition")
                .bad()
                .expect("valid response");
        }
        resp
    }

    pub fn current_user(&self) -> Option<&str> {
        match &self.state {
            flow::State::Authenticated(user) | flow::State::Selected(user, ..) => {
                Some(user.username.as_str())
            }
            _ => None,
        }
    }

    pub fn selected_view(&mut self) -> Option<&mut MailboxView> {
        match &mut self.state {
            flow::State::Selected(_, view, _) => Some(view),
            _ => None,
        }
    }

    pub fn is_logged_out(&self) -> bool {
        matches!(self.state, flow::State::Logout)
    }
}
