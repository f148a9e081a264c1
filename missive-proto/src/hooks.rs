use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// What the lifecycle hooks get to see of a connection.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    /// Opaque per-connection identifier, stable for the connection's life.
    pub id: String,
    pub remote_addr: SocketAddr,
    pub protocol: &'static str,
}

impl SessionInfo {
    pub fn new(remote_addr: SocketAddr, protocol: &'static str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            remote_addr,
            protocol,
        }
    }
}

/// Connection lifecycle hooks, honored by the IMAP and POP3 servers.
///
/// A failed `on_connect` makes the server greet with `* BYE` (IMAP) or
/// `-ERR` (POP3) and close. `on_close` runs exactly once per connection.
#[async_trait]
pub trait ConnectionHooks: Send + Sync {
    async fn on_connect(&self, _session: &SessionInfo) -> Result<()> {
        Ok(())
    }

    async fn on_close(&self, _session: &SessionInfo) {}
}

pub struct NoHooks;

#[async_trait]
impl ConnectionHooks for NoHooks {}

pub type ArcHooks = Arc<dyn ConnectionHooks>;
