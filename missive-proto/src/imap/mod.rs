pub mod capability;
pub mod command;
pub mod flow;
pub mod framer;
pub mod index;
pub mod mailbox_view;
pub mod response;
pub mod search;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use missive_codec::imap::parse::parse_command;
use missive_codec::imap::response::{Code, StatusKind, StatusResponse};
use missive_codec::imap::types::{Command, CommandBody};
use missive_collections::mail::store::ArcMessageStore;
use missive_collections::notifier::Notifier;
use missive_user::config::{ImapConfig, ImapUnsecureConfig, LimitsConfig};
use missive_user::login::ArcLoginProvider;

use crate::hooks::{ArcHooks, ConnectionHooks, SessionInfo};
use crate::imap::capability::ServerCapability;
use crate::imap::framer::{Frame, FramerError, ImapFramer, OutboundPipe};
use crate::imap::mailbox_view::UpdateParameters;
use crate::imap::response::Response;
use crate::imap::session::Instance;
use crate::tls::{AnyStream, BoxStream};

const MAX_AUTH_FAILURES: u32 = 3;
const IDLE_TIMEOUT: Duration = Duration::from_secs(28 * 60);

/// Everything a connection needs from the surrounding server.
#[derive(Clone)]
pub struct ServerContext {
    pub login_provider: ArcLoginProvider,
    pub store: ArcMessageStore,
    pub notifier: Arc<Notifier>,
    pub hooks: ArcHooks,
    pub limits: LimitsConfig,
    /// Acceptor for STARTTLS upgrades on cleartext listeners.
    pub starttls: Option<TlsAcceptor>,
}

pub struct Server {
    bind_addr: SocketAddr,
    ctx: ServerContext,
    /// TLS wrapped around every accepted socket (IMAPS listener).
    implicit_tls: Option<TlsAcceptor>,
}

pub fn new(config: ImapConfig, ctx: ServerContext) -> Result<Server> {
    let acceptor = crate::tls::acceptor(&config.certs, &config.key)?;
    Ok(Server {
        bind_addr: config.bind_addr,
        ctx,
        implicit_tls: Some(acceptor),
    })
}

pub fn new_unsecure(config: ImapUnsecureConfig, ctx: ServerContext) -> Server {
    Server {
        bind_addr: config.bind_addr,
        ctx,
        implicit_tls: None,
    }
}

impl Server {
    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("IMAP server listening on {:#}", self.bind_addr);

        let mut connections = FuturesUnordered::new();

        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = tokio::select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };
            tracing::info!("IMAP: accepted connection from {}", remote_addr);

            let ctx = self.ctx.clone();
            let implicit_tls = self.implicit_tls.clone();
            let conn = tokio::spawn(async move {
                let stream: BoxStream = match implicit_tls {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(stream) => Box::new(stream),
                        Err(e) => {
                            tracing::error!(err = ?e, "TLS negotiation failed");
                            return;
                        }
                    },
                    None => Box::new(socket),
                };
                if let Err(e) = serve_connection(stream, remote_addr, ctx, false).await {
                    tracing::error!(addr = %remote_addr, err = ?e, "IMAP connection failed");
                }
            });
            connections.push(conn);
        }
        drop(tcp);

        tracing::info!("IMAP server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }
}

/// Run one IMAP session to completion over any stream. `starttls_possible`
/// advertises STARTTLS; it is false on already-encrypted listeners.
pub async fn serve_connection<S: AnyStream + 'static>(
    stream: S,
    remote_addr: SocketAddr,
    ctx: ServerContext,
    starttls_possible: bool,
) -> Result<()> {
    let info = SessionInfo::new(remote_addr, "imap");
    let hooks = ctx.hooks.clone();

    let starttls = starttls_possible && ctx.starttls.is_some();
    let capabilities = ServerCapability::new(starttls);
    let session = Instance::new(
        ctx.login_provider.clone(),
        ctx.store.clone(),
        ctx.notifier.clone(),
        capabilities.clone(),
        starttls,
    );

    let mut conn = Connection {
        stream: Box::new(stream),
        framer: ImapFramer::new(ctx.limits.max_line_length),
        out: OutboundPipe::new(),
        session,
        notifier: ctx.notifier.clone(),
        tls: ctx.starttls.clone(),
        capabilities,
        timeout: ctx.limits.socket_timeout(),
        info: info.clone(),
        auth_failures: 0,
    };

    if let Err(e) = hooks.on_connect(&info).await {
        tracing::info!(session = %info.id, err = %e, "connection refused by hook");
        let _ = conn.write(b"* BYE Connection refused\r\n").await;
        hooks.on_close(&info).await;
        return Ok(());
    }

    let result = conn.run().await;
    conn.framer.set_closing();
    hooks.on_close(&info).await;
    result
}

struct Connection {
    stream: BoxStream,
    framer: ImapFramer,
    out: OutboundPipe,
    session: Instance,
    notifier: Arc<Notifier>,
    tls: Option<TlsAcceptor>,
    capabilities: ServerCapability,
    timeout: Duration,
    info: SessionInfo,
    auth_failures: u32,
}

impl Connection {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let processed = self.out.process(bytes)?;
        self.stream.write_all(&processed).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn write_response(&mut self, resp: &Response) -> Result<()> {
        let mut buf = Vec::new();
        resp.encode(&mut buf);
        self.write(&buf).await
    }

    async fn write_status(&mut self, status: &StatusResponse) -> Result<()> {
        let mut buf = Vec::new();
        status.encode(&mut buf);
        self.write(&buf).await
    }

    async fn run(&mut self) -> Result<()> {
        self.write_status(&StatusResponse::untagged(
            StatusKind::Ok,
            Some(Code::Capability(self.capabilities.to_vec())),
            "Missive ready",
        ))
        .await?;

        let mut buf = [0u8; 8192];
        loop {
            loop {
                let frame = match self.framer.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::info!(session = %self.info.id, err = %e, "fatal framing error");
                        let _ = self
                            .write_status(&StatusResponse::untagged(
                                StatusKind::Bad,
                                None,
                                "Command line too long",
                            ))
                            .await;
                        return Ok(());
                    }
                };
                match frame {
                    Frame::AckRequired { .. } => {
                        self.write(b"+ OK\r\n").await?;
                        self.framer.acked();
                    }
                    Frame::Command(bytes) => {
                        if !self.handle_command(bytes).await? {
                            return Ok(());
                        }
                    }
                }
            }

            match tokio::time::timeout(self.timeout, self.stream.read(&mut buf)).await {
                Err(_) => {
                    let _ = self.write(b"* BYE Autologout; idle for too long\r\n").await;
                    return Ok(());
                }
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => self.framer.push_raw(&buf[..n])?,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Returns false when the connection must close.
    async fn handle_command(&mut self, bytes: Vec<u8>) -> Result<bool> {
        let mut cmd = match parse_command(&bytes) {
            Ok(cmd) => cmd,
            Err(e) => {
                let tag = extract_tag(&bytes);
                tracing::debug!(session = %self.info.id, err = %e, "unparsable command");
                self.write_status(&StatusResponse {
                    tag,
                    kind: StatusKind::Bad,
                    code: None,
                    text: "Unable to parse command".to_string(),
                })
                .await?;
                return Ok(true);
            }
        };

        // AUTHENTICATE without SASL-IR: fetch the payload through a
        // continuation round before dispatching.
        if let CommandBody::Authenticate {
            mechanism,
            initial_response: None,
        } = &cmd.body
        {
            let mechanism = mechanism.clone();
            self.write(b"+ \r\n").await?;
            let line = match self.read_line().await? {
                Some(line) => line,
                None => return Ok(false),
            };
            let payload = line
                .strip_suffix(b"\r\n")
                .unwrap_or(&line)
                .to_vec();
            if payload == b"*" {
                self.write_status(&StatusResponse {
                    tag: Some(cmd.tag.0.clone()),
                    kind: StatusKind::Bad,
                    code: None,
                    text: "Authentication cancelled".to_string(),
                })
                .await?;
                return Ok(true);
            }
            cmd = Command {
                tag: cmd.tag,
                body: CommandBody::Authenticate {
                    mechanism,
                    initial_response: Some(payload),
                },
            };
        }

        let is_starttls = matches!(cmd.body, CommandBody::StartTls);
        let is_compress = matches!(cmd.body, CommandBody::Compress { .. });
        let is_auth_attempt = matches!(
            cmd.body,
            CommandBody::Login { .. } | CommandBody::Authenticate { .. }
        );
        let tag = cmd.tag.0.clone();

        if matches!(cmd.body, CommandBody::Idle) && self.session.selected_view().is_some() {
            return self.run_idle(tag).await;
        }

        if is_compress && self.out.deflate_active() {
            self.write_status(&StatusResponse {
                tag: Some(tag),
                kind: StatusKind::No,
                code: Some(Code::CompressionActive),
                text: "DEFLATE is already active".to_string(),
            })
            .await?;
            return Ok(true);
        }

        tracing::debug!(session = %self.info.id, cmd = cmd.body.name(), "command");
        let resp = self.session.command(cmd).await;
        let succeeded = matches!(resp.completion.kind, StatusKind::Ok);

        if is_compress && succeeded {
            // The race guard: a framer already in its Closing sub-state
            // refuses the swap and the client gets a clean NO.
            match self.framer.enable_inflate() {
                Ok(()) => {
                    self.write_response(&resp).await?;
                    self.out.enable_deflate();
                }
                Err(FramerError::Closing) => {
                    self.write_status(&StatusResponse {
                        tag: Some(tag),
                        kind: StatusKind::No,
                        code: None,
                        text: "Session is shutting down".to_string(),
                    })
                    .await?;
                }
                Err(e) => return Err(e.into()),
            }
            return Ok(true);
        }

        self.write_response(&resp).await?;

        if is_auth_attempt && !succeeded {
            self.auth_failures += 1;
            if self.auth_failures >= MAX_AUTH_FAILURES {
                self.write(b"* BYE Too many authentication failures\r\n")
                    .await?;
                return Ok(false);
            }
        }

        if is_starttls && succeeded {
            self.upgrade_tls().await?;
        }

        if self.session.is_logged_out() {
            return Ok(false);
        }

        // Untagged updates are deferred while a command runs; flush them
        // now that the tagged line is out.
        self.flush_updates().await?;

        Ok(true)
    }

    async fn upgrade_tls(&mut self) -> Result<()> {
        let acceptor = match self.tls.clone() {
            Some(acceptor) => acceptor,
            None => return Ok(()),
        };
        let plain = std::mem::replace(&mut self.stream, Box::new(tokio::io::duplex(1).0));
        let secured = acceptor.accept(plain).await?;
        self.stream = Box::new(secured);
        // the handshake invalidates any buffered plaintext
        self.framer = ImapFramer::new(self.framer.max_line());
        self.capabilities = ServerCapability::new(false);
        self.session.server_capabilities = ServerCapability::new(false);
        self.session.starttls_available = false;
        tracing::debug!(session = %self.info.id, "connection upgraded to TLS");
        Ok(())
    }

    /// Read frames until one complete bare line arrives.
    async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; 4096];
        loop {
            match self.framer.next_frame()? {
                Some(Frame::Command(bytes)) => return Ok(Some(bytes)),
                Some(Frame::AckRequired { .. }) => {
                    self.write(b"+ OK\r\n").await?;
                    self.framer.acked();
                }
                None => match tokio::time::timeout(self.timeout, self.stream.read(&mut buf)).await
                {
                    Err(_) | Ok(Ok(0)) => return Ok(None),
                    Ok(Ok(n)) => self.framer.push_raw(&buf[..n])?,
                    Ok(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    /// IDLE: stream untagged updates until the client sends DONE.
    async fn run_idle(&mut self, tag: String) -> Result<bool> {
        let user = match self.session.current_user() {
            Some(user) => user.to_string(),
            None => return Ok(true),
        };
        let mut events = self.notifier.subscribe_user(&user).await?;
        self.write(b"+ idling\r\n").await?;

        // whatever queued up before IDLE goes out immediately
        self.flush_updates().await?;

        let mut buf = [0u8; 4096];
        let outcome = loop {
            // a pipelined DONE may already sit in the framer
            let mut line = None;
            while let Some(frame) = self.framer.next_frame()? {
                if let Frame::Command(bytes) = frame {
                    line = Some(bytes);
                    break;
                }
            }
            if let Some(bytes) = line {
                let is_done = bytes
                    .strip_suffix(b"\r\n")
                    .unwrap_or(&bytes)
                    .eq_ignore_ascii_case(b"DONE");
                let (kind, text) = match is_done {
                    true => (StatusKind::Ok, "IDLE completed"),
                    false => (StatusKind::Bad, "Expected DONE"),
                };
                self.write_status(&StatusResponse {
                    tag: Some(tag.clone()),
                    kind,
                    code: None,
                    text: text.to_string(),
                })
                .await?;
                break true;
            }

            tokio::select! {
                read = tokio::time::timeout(IDLE_TIMEOUT, self.stream.read(&mut buf)) => {
                    match read {
                        Err(_) | Ok(Ok(0)) => break false,
                        Ok(Ok(n)) => self.framer.push_raw(&buf[..n])?,
                        Ok(Err(e)) => {
                            self.notifier.release_user(&user).await.ok();
                            return Err(e.into());
                        }
                    }
                }
                _ = events.recv() => {
                    self.flush_updates().await?;
                }
            }
        };

        drop(events);
        self.notifier.release_user(&user).await.ok();
        Ok(outcome)
    }

    async fn flush_updates(&mut self) -> Result<()> {
        let updates = match self.session.selected_view() {
            Some(view) => view.update(UpdateParameters::default()).await?,
            None => return Ok(()),
        };
        for body in updates {
            let mut buf = Vec::new();
            body.encode(&mut buf);
            self.write(&buf).await?;
        }
        Ok(())
    }
}

fn extract_tag(line: &[u8]) -> Option<String> {
    let end = line
        .iter()
        .position(|&b| b == b' ' || b == b'\r')
        .unwrap_or(line.len());
    match end {
        0 => None,
        _ => std::str::from_utf8(&line[..end]).ok().map(str::to_string),
    }
}
