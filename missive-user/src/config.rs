use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub pid: Option<String>,

    pub imap: Option<ImapConfig>,
    pub imap_unsecure: Option<ImapUnsecureConfig>,
    pub pop3: Option<Pop3Config>,
    pub pop3_unsecure: Option<Pop3UnsecureConfig>,
    pub jmap: Option<JmapConfig>,

    pub users: UserManagement,

    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub changelog: ChangelogConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "user_driver")]
pub enum UserManagement {
    Static(LoginStaticConfig),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginStaticConfig {
    pub user_list: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImapConfig {
    pub bind_addr: SocketAddr,
    pub certs: PathBuf,
    pub key: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImapUnsecureConfig {
    pub bind_addr: SocketAddr,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Pop3Config {
    pub bind_addr: SocketAddr,
    pub certs: PathBuf,
    pub key: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Pop3UnsecureConfig {
    pub bind_addr: SocketAddr,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JmapConfig {
    pub bind_addr: SocketAddr,
    pub certs: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LimitsConfig {
    /// Inactivity timeout per connection, in milliseconds.
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,

    /// Maximum length of a non-literal protocol line, in bytes.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Maximum accepted JMAP blob upload, in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            socket_timeout_ms: default_socket_timeout_ms(),
            max_line_length: default_max_line_length(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl LimitsConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChangelogConfig {
    /// Bounded retention of the per-user change log.
    #[serde(default = "default_changelog_max_entries")]
    pub max_entries: usize,

    /// Entries kept in the cache after a compaction run.
    #[serde(default = "default_changelog_compact_keep")]
    pub compact_keep: usize,
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            max_entries: default_changelog_max_entries(),
            compact_keep: default_changelog_compact_keep(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NotifierConfig {
    /// Worker registrations older than this are considered stale.
    #[serde(default = "default_notifier_ttl_secs")]
    pub ttl_secs: u64,

    /// Registration refresh period. Defaults to a quarter of the TTL.
    pub refresh_secs: Option<u64>,

    /// Stable identifier of this worker in the shared registry.
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_notifier_ttl_secs(),
            refresh_secs: None,
            worker_id: default_worker_id(),
        }
    }
}

impl NotifierConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh_period(&self) -> Duration {
        match self.refresh_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs((self.ttl_secs / 4).max(1)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserEntry {
    #[serde(default)]
    pub email_addresses: Vec<String>,
    pub password: String,
}

pub type UserList = HashMap<String, UserEntry>;

pub fn read_config(config_file: PathBuf) -> Result<Config> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}

pub fn read_user_list(list_file: &PathBuf) -> Result<UserList> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(list_file.as_path())?;

    let mut content = String::new();
    file.read_to_string(&mut content)?;

    Ok(toml::from_str(&content)?)
}

fn default_socket_timeout_ms() -> u64 {
    30_000
}

fn default_max_line_length() -> usize {
    64 * 1024
}

fn default_max_upload_bytes() -> usize {
    25 * 1024 * 1024
}

fn default_changelog_max_entries() -> usize {
    5_000
}

fn default_changelog_compact_keep() -> usize {
    1_000
}

fn default_notifier_ttl_secs() -> u64 {
    120
}

fn default_worker_id() -> String {
    format!("missive-{}", uuid::Uuid::new_v4())
}
