use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

/// Outbound submission seam. The real implementation queues into an MTA;
/// the in-memory one records envelopes for the dev server and the tests.
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Returns an opaque submission id.
    async fn submit(
        &self,
        user: &str,
        envelope_from: &str,
        rcpt_to: &[String],
        source: &[u8],
    ) -> Result<String>;
}

pub type ArcSubmitter = Arc<dyn Submitter>;

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedSubmission {
    pub user: String,
    pub envelope_from: String,
    pub rcpt_to: Vec<String>,
    pub size: usize,
}

#[derive(Default)]
pub struct MemSubmitter {
    sent: Mutex<Vec<RecordedSubmission>>,
}

impl MemSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<RecordedSubmission> {
        self.sent.lock().expect("submitter lock poisoned").clone()
    }
}

#[async_trait]
impl Submitter for MemSubmitter {
    async fn submit(
        &self,
        user: &str,
        envelope_from: &str,
        rcpt_to: &[String],
        source: &[u8],
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!(user, from = envelope_from, rcpt = rcpt_to.len(), "recorded submission");
        self.sent
            .lock()
            .expect("submitter lock poisoned")
            .push(RecordedSubmission {
                user: user.to_string(),
                envelope_from: envelope_from.to_string(),
                rcpt_to: rcpt_to.to_vec(),
                size: source.len(),
            });
        Ok(id)
    }
}
