pub mod static_provider;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// What a login provider hands back on a successful authentication.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub email_addresses: Vec<String>,
}

/// The authentication seam of the server.
///
/// IMAP LOGIN/AUTHENTICATE, POP3 USER/PASS and JMAP basic auth all funnel
/// through this trait; implementations decide where the accounts live.
#[async_trait]
pub trait LoginProvider {
    async fn login(&self, username: &str, password: &str) -> Result<Credentials>;

    /// Shared secret needed by digest schemes (POP3 APOP). Providers that
    /// cannot disclose one return `None` and the scheme is not offered.
    async fn apop_secret(&self, _username: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

pub type ArcLoginProvider = Arc<dyn LoginProvider + Send + Sync>;
