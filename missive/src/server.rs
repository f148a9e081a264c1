use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::try_join;
use tokio::sync::watch;

use missive_collections::blob::BlobFacade;
use missive_collections::changelog::{ChangeLog, MemChangeSink};
use missive_collections::mail::store::{ArcMessageStore, MemStore};
use missive_collections::notifier::Notifier;
use missive_collections::submitter::{ArcSubmitter, MemSubmitter};
use missive_proto::hooks::{ArcHooks, NoHooks};
use missive_proto::jmap::dispatch::JmapContext;
use missive_proto::{imap, jmap, pop3};
use missive_user::config::*;
use missive_user::login::static_provider::StaticLoginProvider;
use missive_user::login::ArcLoginProvider;
use missive_user::storage::{ArcKvStore, MemKv};

const COMPACTION_PERIOD: Duration = Duration::from_secs(60);

pub async fn run(config: Config, dev: bool) -> Result<()> {
    let login_provider: ArcLoginProvider = match (&config.users, dev) {
        (_, true) => Arc::new(StaticLoginProvider::from_list(dev_users())),
        (UserManagement::Static(static_config), false) => {
            Arc::new(StaticLoginProvider::new(static_config.clone())?)
        }
    };

    // storage and the services layered on the shared cache
    let kv: ArcKvStore = Arc::new(MemKv::new());
    let store: ArcMessageStore = Arc::new(MemStore::new());
    let changelog = ChangeLog::new(kv.clone(), Arc::new(MemChangeSink::new()), &config.changelog);
    let notifier = Notifier::new(kv.clone(), store.clone(), changelog.clone(), &config.notifier);
    let blobs = BlobFacade::new(kv.clone());
    let submitter: ArcSubmitter = Arc::new(MemSubmitter::new());
    let hooks: ArcHooks = Arc::new(NoHooks);

    let (exit_signal, provoke_exit) = watch_ctrl_c();

    let compactor_task = changelog.spawn_compactor(COMPACTION_PERIOD, exit_signal.clone());
    let notifier_task = tokio::spawn(notifier.clone().run(exit_signal.clone()));

    let imap_ctx = imap::ServerContext {
        login_provider: login_provider.clone(),
        store: store.clone(),
        notifier: notifier.clone(),
        hooks: hooks.clone(),
        limits: config.limits.clone(),
        starttls: None,
    };
    let pop3_ctx = pop3::ServerContext {
        login_provider: login_provider.clone(),
        store: store.clone(),
        notifier: notifier.clone(),
        hooks: hooks.clone(),
        limits: config.limits.clone(),
        stls: None,
    };
    let jmap_ctx = JmapContext {
        store: store.clone(),
        changelog: changelog.clone(),
        notifier: notifier.clone(),
        blobs,
        submitter,
    };

    let imap_secure_server = match config.imap {
        Some(conf) => Some(imap::new(conf, imap_ctx.clone())?),
        None => None,
    };
    let imap_server = config
        .imap_unsecure
        .map(|conf| imap::new_unsecure(conf, imap_ctx));
    let pop3_secure_server = match config.pop3 {
        Some(conf) => Some(pop3::new(conf, pop3_ctx.clone())?),
        None => None,
    };
    let pop3_server = config
        .pop3_unsecure
        .map(|conf| pop3::new_unsecure(conf, pop3_ctx));
    let jmap_server = match config.jmap {
        Some(conf) => Some(jmap::new(
            conf,
            login_provider.clone(),
            jmap_ctx,
            config.limits.clone(),
        )?),
        None => None,
    };

    try_join!(
        run_or_idle_imap(imap_secure_server, exit_signal.clone()),
        run_or_idle_imap(imap_server, exit_signal.clone()),
        run_or_idle_pop3(pop3_secure_server, exit_signal.clone()),
        run_or_idle_pop3(pop3_server, exit_signal.clone()),
        run_or_idle_jmap(jmap_server, exit_signal.clone()),
    )?;
    drop(provoke_exit);

    notifier_task.abort();
    compactor_task.abort();
    tracing::info!("all servers stopped");
    Ok(())
}

async fn run_or_idle_imap(
    server: Option<imap::Server>,
    exit: watch::Receiver<bool>,
) -> Result<()> {
    match server {
        Some(server) => server.run(exit).await,
        None => Ok(()),
    }
}

async fn run_or_idle_pop3(
    server: Option<pop3::Server>,
    exit: watch::Receiver<bool>,
) -> Result<()> {
    match server {
        Some(server) => server.run(exit).await,
        None => Ok(()),
    }
}

async fn run_or_idle_jmap(
    server: Option<jmap::Server>,
    exit: watch::Receiver<bool>,
) -> Result<()> {
    match server {
        Some(server) => server.run(exit).await,
        None => Ok(()),
    }
}

/// Flip the shutdown watch on SIGINT.
fn watch_ctrl_c() -> (watch::Receiver<bool>, Arc<watch::Sender<bool>>) {
    let (send, recv) = watch::channel(false);
    let send = Arc::new(send);
    let send_ctrl_c = send.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        tracing::info!("SIGINT received, shutting down");
        let _ = send_ctrl_c.send(true);
    });
    (recv, send)
}

fn dev_users() -> UserList {
    let mut users = HashMap::new();
    users.insert(
        "alice".to_string(),
        UserEntry {
            email_addresses: vec!["alice@missive.localhost".to_string()],
            password: "hunter2".to_string(),
        },
    );
    users.insert(
        "bob".to_string(),
        UserEntry {
            email_addresses: vec!["bob@missive.localhost".to_string()],
            password: "sponge".to_string(),
        },
    );
    users
}
