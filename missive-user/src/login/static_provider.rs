use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::config::{read_user_list, LoginStaticConfig, UserList};
use crate::login::{Credentials, LoginProvider};

/// Login provider backed by a static TOML user list.
pub struct StaticLoginProvider {
    users: UserList,
}

impl StaticLoginProvider {
    pub fn new(config: LoginStaticConfig) -> Result<Self> {
        let users = read_user_list(&config.user_list)?;
        tracing::info!(count = users.len(), "loaded static user list");
        Ok(Self { users })
    }

    pub fn from_list(users: UserList) -> Self {
        Self { users }
    }
}

#[async_trait]
impl LoginProvider for StaticLoginProvider {
    async fn login(&self, username: &str, password: &str) -> Result<Credentials> {
        let entry = self
            .users
            .get(username)
            .ok_or(anyhow!("user {} does not exist", username))?;

        if !constant_time_eq(entry.password.as_bytes(), password.as_bytes()) {
            bail!("invalid password for user {}", username);
        }

        Ok(Credentials {
            username: username.to_string(),
            email_addresses: entry.email_addresses.clone(),
        })
    }

    async fn apop_secret(&self, username: &str) -> Result<Option<String>> {
        Ok(self.users.get(username).map(|e| e.password.clone()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserEntry;

    fn provider() -> StaticLoginProvider {
        let mut users = UserList::new();
        users.insert(
            "alice".to_string(),
            UserEntry {
                email_addresses: vec!["alice@example.tld".to_string()],
                password: "hunter2".to_string(),
            },
        );
        StaticLoginProvider::from_list(users)
    }

    #[tokio::test]
    async fn accepts_valid_credentials() {
        let creds = provider().login("alice", "hunter2").await.unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.email_addresses, vec!["alice@example.tld"]);
    }

    #[tokio::test]
    async fn rejects_wrong_password_and_unknown_user() {
        assert!(provider().login("alice", "hunter3").await.is_err());
        assert!(provider().login("bob", "hunter2").await.is_err());
    }

    #[tokio::test]
    async fn discloses_apop_secret() {
        let secret = provider().apop_secret("alice").await.unwrap();
        assert_eq!(secret.as_deref(), Some("hunter2"));
    }
}
