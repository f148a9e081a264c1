pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use missive_collections::mail::store::ArcMessageStore;
use missive_collections::notifier::Notifier;
use missive_user::config::{LimitsConfig, Pop3Config, Pop3UnsecureConfig};
use missive_user::login::ArcLoginProvider;

use crate::hooks::ArcHooks;
use crate::tls::BoxStream;

pub use session::serve_connection;

#[derive(Clone)]
pub struct ServerContext {
    pub login_provider: ArcLoginProvider,
    pub store: ArcMessageStore,
    pub notifier: Arc<Notifier>,
    pub hooks: ArcHooks,
    pub limits: LimitsConfig,
    /// Acceptor for STLS upgrades on cleartext listeners.
    pub stls: Option<TlsAcceptor>,
}

pub struct Server {
    bind_addr: SocketAddr,
    ctx: ServerContext,
    implicit_tls: Option<TlsAcceptor>,
}

pub fn new(config: Pop3Config, ctx: ServerContext) -> Result<Server> {
    let acceptor = crate::tls::acceptor(&config.certs, &config.key)?;
    Ok(Server {
        bind_addr: config.bind_addr,
        ctx,
        implicit_tls: Some(acceptor),
    })
}

pub fn new_unsecure(config: Pop3UnsecureConfig, ctx: ServerContext) -> Server {
    Server {
        bind_addr: config.bind_addr,
        ctx,
        implicit_tls: None,
    }
}

impl Server {
    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("POP3 server listening on {:#}", self.bind_addr);

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
            tracing::info!("POP3: accepted connection from {}", remote_addr);

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
                    tracing::error!(addr = %remote_addr, err = ?e, "POP3 connection failed");
                }
            });
            connections.push(conn);
        }
        drop(tcp);

        tracing::info!("POP3 server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }
}
