/*
 * One POP3 connection: AUTHORIZATION -> TRANSACTION -> UPDATE.
 *
 * Pipelining discipline: commands are processed strictly in arrival
 * order, and a command's complete response (for RETR/TOP that includes
 * the terminating ".\r\n") is fully written before the next buffered
 * command is even parsed. The inactivity timer is re-armed by every
 * command and by every chunk of a long RETR stream.
 */

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use missive_codec::pop3::{self, Pop3Command, TERMINATOR};
use missive_collections::changelog::ChangeKind;
use missive_collections::mail::journal::{JournalEntry, JournalKind};
use missive_collections::mail::store::{MessageStore, StoreError};
use missive_collections::mail::{MailboxId, MessageId};
use missive_user::login::LoginProvider;

use crate::hooks::{ConnectionHooks, SessionInfo};
use crate::pop3::ServerContext;
use crate::tls::{AnyStream, BoxStream};

const MAX_AUTH_FAILURES: u32 = 3;
const RETR_CHUNK: usize = 8 * 1024;

struct PopEntry {
    id: MessageId,
    uidl: String,
    size: u32,
    deleted: bool,
}

struct Maildrop {
    user: String,
    inbox: MailboxId,
    entries: Vec<PopEntry>,
}

impl Maildrop {
    fn live(&self) -> impl Iterator<Item = (usize, &PopEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.deleted)
            .map(|(i, e)| (i + 1, e))
    }

    /// Message by 1-based number; deleted messages no longer exist.
    fn entry(&self, n: u32) -> Option<&PopEntry> {
        self.entries
            .get((n - 1) as usize)
            .filter(|e| !e.deleted)
    }

    fn entry_mut(&mut self, n: u32) -> Option<&mut PopEntry> {
        self.entries
            .get_mut((n - 1) as usize)
            .filter(|e| !e.deleted)
    }
}

enum State {
    Authorization { user: Option<String>, attempts: u32 },
    Transaction(Maildrop),
    Update,
}

pub async fn serve_connection<S: AnyStream + 'static>(
    stream: S,
    remote_addr: SocketAddr,
    ctx: ServerContext,
    stls_possible: bool,
) -> Result<()> {
    let info = SessionInfo::new(remote_addr, "pop3");
    let hooks = ctx.hooks.clone();

    let mut conn = Connection {
        stream: Box::new(stream),
        buffer: Vec::new(),
        timeout: ctx.limits.socket_timeout(),
        max_line: ctx.limits.max_line_length,
        banner: format!("<{}@missive>", uuid::Uuid::new_v4().simple()),
        state: State::Authorization {
            user: None,
            attempts: 0,
        },
        stls_possible,
        ctx,
        info: info.clone(),
    };

    if let Err(e) = hooks.on_connect(&info).await {
        tracing::info!(session = %info.id, err = %e, "connection refused by hook");
        let _ = conn.write(&pop3::err("Connection refused")).await;
        hooks.on_close(&info).await;
        return Ok(());
    }

    let result = conn.run().await;
    hooks.on_close(&info).await;
    result
}

struct Connection {
    stream: BoxStream,
    buffer: Vec<u8>,
    timeout: Duration,
    max_line: usize,
    banner: String,
    state: State,
    stls_possible: bool,
    ctx: ServerContext,
    info: SessionInfo,
}

impl Connection {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        tokio::time::timeout(self.timeout, async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        })
        .await??;
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let greeting = format!("+OK Missive POP3 server ready {}\r\n", self.banner);
        self.write(greeting.as_bytes()).await?;

        let mut buf = [0u8; 8192];
        loop {
            // drain every buffered command before reading again; each
            // response is fully transmitted before the next line is parsed
            while let Some(line) = self.take_line()? {
                if !self.handle_line(&line).await? {
                    return Ok(());
                }
            }

            match tokio::time::timeout(self.timeout, self.stream.read(&mut buf)).await {
                Err(_) => {
                    let _ = self.write(&pop3::err("Autologout; idle for too long")).await;
                    return Ok(());
                }
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => self.buffer.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    fn take_line(&mut self) -> Result<Option<Vec<u8>>> {
        match self.buffer.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => {
                let line: Vec<u8> = self.buffer.drain(..pos + 2).collect();
                Ok(Some(line))
            }
            None if self.buffer.len() > self.max_line => {
                anyhow::bail!("command line too long")
            }
            None => Ok(None),
        }
    }

    /// Returns false when the connection must close.
    async fn handle_line(&mut self, line: &[u8]) -> Result<bool> {
        let cmd = match pop3::parse_command(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::debug!(session = %self.info.id, err = %e, "bad POP3 command");
                self.write(&pop3::err("Syntax error")).await?;
                return Ok(true);
            }
        };
        tracing::debug!(session = %self.info.id, cmd = cmd.name(), "command");

        match cmd {
            Pop3Command::Capa => self.capa().await.map(|_| true),
            Pop3Command::Noop => self.write(&pop3::ok("")).await.map(|_| true),
            Pop3Command::Quit => self.quit().await.map(|_| false),
            Pop3Command::Stls => self.stls().await.map(|_| true),
            Pop3Command::User(name) => self.user(name).await.map(|_| true),
            Pop3Command::Pass(password) => self.pass(password).await,
            Pop3Command::Apop { user, digest } => self.apop(user, digest).await,
            Pop3Command::Stat => self.stat().await.map(|_| true),
            Pop3Command::List(target) => self.list(target).await.map(|_| true),
            Pop3Command::Uidl(target) => self.uidl(target).await.map(|_| true),
            Pop3Command::Retr(n) => self.retr(n).await.map(|_| true),
            Pop3Command::Top(n, lines) => self.top(n, lines).await.map(|_| true),
            Pop3Command::Dele(n) => self.dele(n).await.map(|_| true),
            Pop3Command::Rset => self.rset().await.map(|_| true),
        }
    }

    async fn capa(&mut self) -> Result<()> {
        let mut f = String::new();
        f.push_str("+OK Capability list follows\r\n");
        f.push_str("USER\r\nTOP\r\nUIDL\r\nPIPELINING\r\nRESP-CODES\r\n");
        if self.stls_possible && self.ctx.stls.is_some() {
            f.push_str("STLS\r\n");
        }
        f.push_str(".\r\n");
        self.write(f.as_bytes()).await
    }

    async fn stls(&mut self) -> Result<()> {
        if !matches!(self.state, State::Authorization { .. }) {
            return self.write(&pop3::err("STLS only in AUTHORIZATION state")).await;
        }
        let acceptor = match (self.stls_possible, self.ctx.stls.clone()) {
            (true, Some(acceptor)) => acceptor,
            _ => return self.write(&pop3::err("TLS not available")).await,
        };
        self.write(&pop3::ok("Begin TLS negotiation")).await?;
        let plain = std::mem::replace(&mut self.stream, Box::new(tokio::io::duplex(1).0));
        let secured = acceptor.accept(plain).await?;
        self.stream = Box::new(secured);
        self.buffer.clear();
        self.stls_possible = false;
        tracing::debug!(session = %self.info.id, "connection upgraded to TLS");
        Ok(())
    }

    async fn user(&mut self, name: String) -> Result<()> {
        let accepted = match &mut self.state {
            State::Authorization { user, .. } => {
                *user = Some(name);
                true
            }
            _ => false,
        };
        match accepted {
            true => self.write(&pop3::ok("Send your password")).await,
            false => self.write(&pop3::err("USER only in AUTHORIZATION state")).await,
        }
    }

    async fn pass(&mut self, password: String) -> Result<bool> {
        enum PassState {
            Ready(String),
            NoUser,
            WrongState,
        }
        let pass_state = match &self.state {
            State::Authorization { user: Some(u), .. } => PassState::Ready(u.clone()),
            State::Authorization { user: None, .. } => PassState::NoUser,
            _ => PassState::WrongState,
        };
        let username = match pass_state {
            PassState::Ready(username) => username,
            PassState::NoUser => {
                self.write(&pop3::err("Send USER first")).await?;
                return Ok(true);
            }
            PassState::WrongState => {
                self.write(&pop3::err("PASS only in AUTHORIZATION state")).await?;
                return Ok(true);
            }
        };

        match self.ctx.login_provider.login(&username, &password).await {
            Ok(_) => self.open_maildrop(&username).await.map(|_| true),
            Err(_) => self.auth_failed().await,
        }
    }

    async fn apop(&mut self, user: String, digest: String) -> Result<bool> {
        if !matches!(self.state, State::Authorization { .. }) {
            self.write(&pop3::err("APOP only in AUTHORIZATION state")).await?;
            return Ok(true);
        }
        let secret = self.ctx.login_provider.apop_secret(&user).await?;
        let expected = secret
            .map(|secret| format!("{:x}", md5::compute(format!("{}{}", self.banner, secret))));
        match expected {
            Some(expected) if expected == digest => {
                self.open_maildrop(&user).await.map(|_| true)
            }
            _ => self.auth_failed().await,
        }
    }

    async fn auth_failed(&mut self) -> Result<bool> {
        let attempts = match &mut self.state {
            State::Authorization { attempts, user } => {
                *user = None;
                *attempts += 1;
                *attempts
            }
            _ => 0,
        };
        self.write(&pop3::err("Invalid credentials")).await?;
        if attempts >= MAX_AUTH_FAILURES {
            tracing::info!(session = %self.info.id, "too many authentication failures");
            return Ok(false);
        }
        Ok(true)
    }

    async fn open_maildrop(&mut self, username: &str) -> Result<()> {
        self.ctx.store.ensure_user(username).await?;
        let inbox = self
            .ctx
            .store
            .mailbox_by_path(username, "INBOX")
            .await?
            .ok_or(StoreError::NotFound)?;
        let messages = self.ctx.store.messages_in(username, inbox.id).await?;
        let entries = messages
            .iter()
            .map(|m| PopEntry {
                id: m.id,
                uidl: m.id.to_string(),
                size: m.size,
                deleted: false,
            })
            .collect::<Vec<_>>();
        tracing::info!(session = %self.info.id, user = username, count = entries.len(), "maildrop locked");

        let total: u64 = entries.iter().map(|e| e.size as u64).sum();
        self.state = State::Transaction(Maildrop {
            user: username.to_string(),
            inbox: inbox.id,
            entries,
        });
        self.write(&pop3::ok(&format!(
            "Maildrop has {} messages ({} octets)",
            total_count(&self.state),
            total
        )))
        .await
    }

    fn maildrop(&mut self) -> Option<&mut Maildrop> {
        match &mut self.state {
            State::Transaction(drop) => Some(drop),
            _ => None,
        }
    }

    async fn stat(&mut self) -> Result<()> {
        let reply = match self.maildrop() {
            None => pop3::err("STAT only in TRANSACTION state"),
            Some(drop) => {
                let count = drop.live().count();
                let size: u64 = drop.live().map(|(_, e)| e.size as u64).sum();
                format!("+OK {} {}\r\n", count, size).into_bytes()
            }
        };
        self.write(&reply).await
    }

    async fn list(&mut self, target: Option<u32>) -> Result<()> {
        let reply = match self.maildrop() {
            None => pop3::err("LIST only in TRANSACTION state"),
            Some(drop) => match target {
                Some(n) => match drop.entry(n) {
                    Some(entry) => format!("+OK {} {}\r\n", n, entry.size).into_bytes(),
                    None => pop3::err("No such message"),
                },
                None => {
                    let mut f = format!("+OK {} messages\r\n", drop.live().count());
                    for (n, entry) in drop.live() {
                        f.push_str(&format!("{} {}\r\n", n, entry.size));
                    }
                    f.push_str(".\r\n");
                    f.into_bytes()
                }
            },
        };
        self.write(&reply).await
    }

    async fn uidl(&mut self, target: Option<u32>) -> Result<()> {
        let reply = match self.maildrop() {
            None => pop3::err("UIDL only in TRANSACTION state"),
            Some(drop) => match target {
                Some(n) => match drop.entry(n) {
                    Some(entry) => format!("+OK {} {}\r\n", n, entry.uidl).into_bytes(),
                    None => pop3::err("No such message"),
                },
                None => {
                    let mut f = String::from("+OK\r\n");
                    for (n, entry) in drop.live() {
                        f.push_str(&format!("{} {}\r\n", n, entry.uidl));
                    }
                    f.push_str(".\r\n");
                    f.into_bytes()
                }
            },
        };
        self.write(&reply).await
    }

    /// The whole message, dot-stuffed, streamed in chunks. The terminator
    /// is written before this function returns, which is what serializes
    /// pipelined responses.
    async fn retr(&mut self, n: u32) -> Result<()> {
        let (user, id) = match self.maildrop().and_then(|d| d.entry(n).map(|e| e.id)) {
            Some(id) => match &self.state {
                State::Transaction(drop) => (drop.user.clone(), id),
                _ => unreachable!("maildrop implies transaction state"),
            },
            None => return self.write(&pop3::err("No such message")).await,
        };

        let source = self.ctx.store.message_source(&user, id).await?;
        self.write(&pop3::ok(&format!("{} octets", source.len()))).await?;
        let stuffed = pop3::dot_stuff(&source);
        // chunked writes: each one re-arms the inactivity timer
        for chunk in stuffed.chunks(RETR_CHUNK) {
            self.write(chunk).await?;
        }
        self.write(TERMINATOR).await
    }

    async fn top(&mut self, n: u32, lines: u32) -> Result<()> {
        let (user, id) = match self.maildrop().and_then(|d| d.entry(n).map(|e| e.id)) {
            Some(id) => match &self.state {
                State::Transaction(drop) => (drop.user.clone(), id),
                _ => unreachable!("maildrop implies transaction state"),
            },
            None => return self.write(&pop3::err("No such message")).await,
        };

        let source = self.ctx.store.message_source(&user, id).await?;
        let preview = top_of(&source, lines);
        self.write(&pop3::ok("Top of message follows")).await?;
        self.write(&pop3::dot_stuff(&preview)).await?;
        self.write(TERMINATOR).await
    }

    async fn dele(&mut self, n: u32) -> Result<()> {
        let reply = match self.maildrop().and_then(|d| d.entry_mut(n)) {
            Some(entry) => {
                entry.deleted = true;
                pop3::ok(&format!("Message {} deleted", n))
            }
            None => pop3::err("No such message"),
        };
        self.write(&reply).await
    }

    async fn rset(&mut self) -> Result<()> {
        let reply = match self.maildrop() {
            None => pop3::err("RSET only in TRANSACTION state"),
            Some(drop) => {
                for entry in drop.entries.iter_mut() {
                    entry.deleted = false;
                }
                pop3::ok("Deletion marks removed")
            }
        };
        self.write(&reply).await
    }

    /// QUIT from TRANSACTION enters UPDATE and removes the marked
    /// messages; QUIT from AUTHORIZATION just closes.
    async fn quit(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, State::Update);
        if let State::Transaction(drop) = state {
            let doomed: Vec<MessageId> = drop
                .entries
                .iter()
                .filter(|e| e.deleted)
                .map(|e| e.id)
                .collect();
            let mut journal = Vec::new();
            let mut changes = Vec::new();
            for id in doomed {
                let deleted = self.ctx.store.delete_message(&drop.user, id).await?;
                journal.push(JournalEntry::new(
                    drop.inbox,
                    deleted.modseq,
                    JournalKind::Expunge,
                    deleted.uid,
                    id,
                    vec![],
                ));
                changes.push((ChangeKind::Destroyed, id.to_string()));
            }
            if !journal.is_empty() {
                self.ctx.notifier.publish(&drop.user, journal, changes).await?;
            }
        }
        self.write(&pop3::ok("Missive POP3 server signing off")).await
    }
}

fn total_count(state: &State) -> usize {
    match state {
        State::Transaction(drop) => drop.live().count(),
        _ => 0,
    }
}

/// Headers, the blank separator, and the first `lines` lines of the body.
fn top_of(source: &[u8], lines: u32) -> Vec<u8> {
    let split = source
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4);
    match split {
        None => source.to_vec(),
        Some(body_start) => {
            let mut out = source[..body_start].to_vec();
            let body = &source[body_start..];
            let mut taken = 0;
            for line in body.split_inclusive(|&b| b == b'\n') {
                if taken >= lines {
                    break;
                }
                out.extend_from_slice(line);
                taken += 1;
            }
            out
        }
    }
}
