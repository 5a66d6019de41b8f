#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use keytrust_kernel_contracts::policy::{PolicyDocument, PolicyVersion};
use keytrust_storage::repo::TrustGraphRepo;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct FetchError {
    pub message: String,
    pub error_code: Option<i64>,
    pub retriable: bool,
    pub retry_after: Option<Duration>,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: None,
            retriable: false,
            retry_after: None,
        }
    }

    pub fn with_error_code(mut self, code: i64, retriable: bool) -> Self {
        self.error_code = Some(code);
        self.retriable = retriable;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Network side of the trust graph. Implementations never retry on the caller's behalf.
#[async_trait]
pub trait RemoteTrustService: Send + Sync {
    /// Pulls remote peer/voucher deltas and writes them through `store`.
    async fn fetch_and_persist_changes_if_needed(
        &self,
        store: &mut (dyn TrustGraphRepo + Send),
    ) -> Result<(), FetchError>;

    async fn fetch_policy_documents(
        &self,
        versions: &[PolicyVersion],
    ) -> Result<Vec<PolicyDocument>, FetchError>;
}
