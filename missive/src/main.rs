mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use missive_user::config::*;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// A developer mode: loopback listeners, in-memory storage, a static
    /// demo user list. NOT INTENDED FOR PRODUCTION.
    #[clap(long)]
    dev: bool,

    #[clap(short, long, env = "MISSIVE_CONFIG", default_value = "missive.toml")]
    /// Path to the main Missive configuration file
    config_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the mail server daemon
    Daemon,

    #[clap(subcommand)]
    /// Specific tooling, not part of a normal workflow
    Tools(ToolsCommand),
}

#[derive(Subcommand, Debug)]
enum ToolsCommand {
    /// Print a default configuration file on stdout
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "missive=info,missive_proto=info,missive_collections=info")
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Missive");

    match args.command {
        Command::Daemon => {
            let config = match args.dev {
                true => dev_config(),
                false => read_config(args.config_file)?,
            };
            server::run(config, args.dev).await
        }
        Command::Tools(ToolsCommand::DefaultConfig) => {
            println!("{}", toml::to_string(&dev_config())?);
            Ok(())
        }
    }
}

fn dev_config() -> Config {
    Config {
        pid: None,
        imap: None,
        imap_unsecure: Some(ImapUnsecureConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 1143)),
        }),
        pop3: None,
        pop3_unsecure: Some(Pop3UnsecureConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 1110)),
        }),
        jmap: Some(JmapConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            certs: None,
            key: None,
        }),
        users: UserManagement::Static(LoginStaticConfig {
            user_list: PathBuf::from("users.toml"),
        }),
        limits: LimitsConfig::default(),
        changelog: ChangelogConfig::default(),
        notifier: NotifierConfig::default(),
    }
}
