use std::sync::Arc;

use thiserror::Error;

use missive_user::login::Credentials;

use crate::imap::mailbox_view::MailboxView;

#[derive(Debug, Error)]
pub enum Error {
    #[error("forbidden IMAP state transition")]
    ForbiddenTransition,
}

#[derive(Clone, Debug)]
pub struct User {
    pub username: String,
    pub email_addresses: Vec<String>,
}

impl From<Credentials> for User {
    fn from(creds: Credentials) -> Self {
        Self {
            username: creds.username,
            email_addresses: creds.email_addresses,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxPerm {
    ReadOnly,
    ReadWrite,
}

// See RFC 3501 section 3: the connection-level state machine.
pub enum State {
    NotAuthenticated,
    Authenticated(Arc<User>),
    Selected(Arc<User>, MailboxView, MailboxPerm),
    Logout,
}

pub enum Transition {
    None,
    Authenticate(Arc<User>),
    Select(MailboxView, MailboxPerm),
    Unselect,
    Logout,
}

impl State {
    pub fn apply(&mut self, tr: Transition) -> Result<(), Error> {
        let old = std::mem::replace(self, State::Logout);
        let new = match (old, tr) {
            (state, Transition::None) => state,
            (State::NotAuthenticated, Transition::Authenticate(user)) => {
                State::Authenticated(user)
            }
            (State::Authenticated(user), Transition::Select(view, perm))
            | (State::Selected(user, _, _), Transition::Select(view, perm)) => {
                State::Selected(user, view, perm)
            }
            (State::Selected(user, _, _), Transition::Unselect) => State::Authenticated(user),
            (_, Transition::Logout) => State::Logout,
            _ => return Err(Error::ForbiddenTransition),
        };
        *self = new;
        Ok(())
    }
}
