#![forbid(unsafe_code)]

use std::time::Duration;

use keytrust_engines::policy_eval::PolicyEvalError;
use keytrust_engines::recovery_keys::RecoveryKeyError;
use keytrust_kernel_contracts::peer::PeerId;
use keytrust_kernel_contracts::policy::PolicyVersion;
use keytrust_storage::trust_store::StorageError;

use crate::remote::FetchError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyResolutionError {
    #[error("no policy document at or below {cap} is available for candidate {candidate}")]
    NotFound {
        candidate: PeerId,
        cap: PolicyVersion,
    },
    #[error(transparent)]
    Evaluation(#[from] PolicyEvalError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrustError {
    #[error("no prepared identity")]
    NoPreparedIdentity,
    #[error("invalid permanent info or signature")]
    InvalidPermanentInfoOrSignature,
    #[error("invalid stable info or signature")]
    InvalidStableInfoOrSignature,
    #[error("failed to create recovery key: {0}")]
    FailedToCreateRecoveryKey(RecoveryKeyError),
    #[error("recovery key is not enrolled")]
    RecoveryKeyNotEnrolled,
    #[error("recovery key is not trusted by any peer able to introduce this device")]
    UntrustedRecoveryKey,
    #[error("sponsor {0} is not registered")]
    SponsorNotRegistered(PeerId),
    #[error("policy resolution failed: {0}")]
    PolicyResolutionFailed(#[from] PolicyResolutionError),
    #[error("fetch failed: {0}")]
    FetchFailed(#[from] FetchError),
    #[error("malformed identifier: {0}")]
    MalformedIdentifier(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl TrustError {
    /// Server-supplied retry hint, if the failure came from the remote service.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TrustError::FetchFailed(err) => err.retry_after,
            _ => None,
        }
    }
}
