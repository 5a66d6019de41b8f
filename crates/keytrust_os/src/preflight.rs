#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use keytrust_engines::crypto::CryptoProvider;
use keytrust_engines::identity_codec::IdentityCodec;
use keytrust_engines::policy_eval::{evaluate_syncing_policy, SyncingPolicyInput};
use keytrust_engines::recovery_keys::{CustodianKeySet, RecoveryKeySet};
use keytrust_kernel_contracts::peer::{PeerId, PermanentInfo, StableInfo};
use keytrust_kernel_contracts::policy::{
    PolicyVersion, SyncingPolicy, UserControllableViewStatus,
};
use keytrust_storage::repo::TrustGraphRepo;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PolicyResolutionError, TrustError};
use crate::trust_graph::{Peer, TrustGraphModel};

/// Custodian recovery credential as presented by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodianRecoveryKeyRequest {
    pub uuid: String,
    pub recovery_string: String,
    pub salt: String,
}

impl CustodianRecoveryKeyRequest {
    pub fn parse_uuid(&self) -> Result<Uuid, TrustError> {
        Uuid::parse_str(self.uuid.trim())
            .map_err(|err| TrustError::MalformedIdentifier(format!("{}: {err}", self.uuid)))
    }
}

/// Peer ID the credential would join as, plus the policy it would sync under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightOutcome {
    pub peer_id: PeerId,
    pub syncing_policy: SyncingPolicy,
}

#[derive(Debug, Clone)]
struct EgoIdentity {
    permanent_info: PermanentInfo,
    stable_info: StableInfo,
}

/// Policy version the ego claims, if its identity parses. Used to prefetch its document.
pub fn ego_claimed_policy_version<C: CryptoProvider + ?Sized>(
    repo: &dyn TrustGraphRepo,
    codec: &IdentityCodec<'_, C>,
) -> Option<PolicyVersion> {
    load_ego_identity(repo, codec)
        .ok()
        .map(|ego| ego.stable_info.policy_version)
}

fn load_ego_identity<C: CryptoProvider + ?Sized>(
    repo: &dyn TrustGraphRepo,
    codec: &IdentityCodec<'_, C>,
) -> Result<EgoIdentity, TrustError> {
    let row = repo.ego_identity_row().ok_or(TrustError::NoPreparedIdentity)?;
    let permanent_info = codec
        .parse_permanent_info(&row.peer_id, &row.permanent_info)
        .map_err(|err| {
            debug!(%err, "ego permanent info did not parse");
            TrustError::InvalidPermanentInfoOrSignature
        })?;
    let stable_blob = row
        .stable_info
        .as_ref()
        .ok_or(TrustError::NoPreparedIdentity)?;
    let stable_info = codec
        .parse_stable_info(stable_blob, &permanent_info)
        .map_err(|err| {
            debug!(%err, "ego stable info did not parse");
            TrustError::InvalidStableInfoOrSignature
        })?;
    Ok(EgoIdentity {
        permanent_info,
        stable_info,
    })
}

/// Read-only checks that a recovery credential could vouch this device into the graph.
pub struct RecoveryPreflightEngine<'a, C: CryptoProvider + ?Sized> {
    crypto: &'a C,
    repo: &'a dyn TrustGraphRepo,
    model: &'a TrustGraphModel,
}

impl<'a, C: CryptoProvider + ?Sized> RecoveryPreflightEngine<'a, C> {
    pub fn new(crypto: &'a C, repo: &'a dyn TrustGraphRepo, model: &'a TrustGraphModel) -> Self {
        Self {
            crypto,
            repo,
            model,
        }
    }

    pub fn preflight_vouch_with_recovery_key(
        &self,
        recovery_key: &str,
        salt: &str,
    ) -> Result<PreflightOutcome, TrustError> {
        let ego = load_ego_identity(self.repo, &IdentityCodec::new(self.crypto))?;

        let keys = RecoveryKeySet::derive(self.crypto, recovery_key, salt).map_err(|err| {
            info!(%err, "unable to derive recovery key material");
            TrustError::FailedToCreateRecoveryKey(err)
        })?;

        if !self.model.is_recovery_key_enrolled() {
            info!("no peer has enrolled a recovery key");
            return Err(TrustError::RecoveryKeyNotEnrolled);
        }

        let sponsor_id = self
            .model
            .peer_id_that_trusts_recovery_keys(&keys, &ego.permanent_info, &ego.stable_info)
            .ok_or_else(|| {
                info!(derived = %keys.peer_id, "recovery key is not trusted for this device");
                TrustError::UntrustedRecoveryKey
            })?;
        let sponsor = self.resolve_sponsor(&sponsor_id)?;
        let syncing_policy = self.resolve_policy(sponsor, &ego)?;

        Ok(PreflightOutcome {
            peer_id: keys.peer_id,
            syncing_policy,
        })
    }

    pub fn preflight_vouch_with_custodian_recovery_key(
        &self,
        request: &CustodianRecoveryKeyRequest,
    ) -> Result<PreflightOutcome, TrustError> {
        let ego = load_ego_identity(self.repo, &IdentityCodec::new(self.crypto))?;

        // A key that cannot be named cannot have been enrolled.
        let uuid = request.parse_uuid().map_err(|err| {
            info!(%err, "custodian recovery key UUID is malformed");
            TrustError::RecoveryKeyNotEnrolled
        })?;
        let enrolled = self
            .model
            .find_custodian_recovery_key(uuid)
            .ok_or_else(|| {
                info!(%uuid, "custodian recovery key is unknown");
                TrustError::RecoveryKeyNotEnrolled
            })?;
        let keys = CustodianKeySet::derive_for(
            self.crypto,
            enrolled,
            &request.recovery_string,
            &request.salt,
        )
        .map_err(|err| {
            info!(%uuid, %err, "unable to derive custodian key material");
            TrustError::FailedToCreateRecoveryKey(err)
        })?;

        if !self.model.is_custodian_recovery_key_enrolled(&enrolled.peer_id) {
            info!(%uuid, custodian = %enrolled.peer_id, "custodian recovery key is not included by any peer");
            return Err(TrustError::RecoveryKeyNotEnrolled);
        }

        let sponsor_id = self
            .model
            .peer_id_that_trusts_custodian_recovery_keys(
                enrolled,
                &ego.permanent_info,
                &ego.stable_info,
            )
            .ok_or_else(|| {
                info!(%uuid, "custodian recovery key is not trusted for this device");
                TrustError::UntrustedRecoveryKey
            })?;
        let sponsor = self.resolve_sponsor(&sponsor_id)?;
        let syncing_policy = self.resolve_policy(sponsor, &ego)?;

        Ok(PreflightOutcome {
            peer_id: keys.peer_id,
            syncing_policy,
        })
    }

    fn resolve_sponsor(&self, sponsor_id: &PeerId) -> Result<&'a Peer, TrustError> {
        self.model
            .peer(sponsor_id)
            .ok_or_else(|| TrustError::SponsorNotRegistered(sponsor_id.clone()))
    }

    fn resolve_policy(&self, sponsor: &Peer, ego: &EgoIdentity) -> Result<SyncingPolicy, TrustError> {
        let mut group: BTreeSet<PeerId> = sponsor.included_peer_ids();
        group.insert(sponsor.peer_id.clone());

        let doc = self
            .model
            .policy(&group, &ego.permanent_info.peer_id, &ego.stable_info)?;
        let sync_user_controllable_views = sponsor
            .stable_info
            .as_ref()
            .and_then(|s| s.sync_user_controllable_views)
            .unwrap_or(UserControllableViewStatus::Unknown);

        let policy = evaluate_syncing_policy(
            self.crypto,
            doc,
            SyncingPolicyInput {
                model_id: &ego.permanent_info.model_id,
                sync_user_controllable_views,
                is_inherited_account: ego.stable_info.is_inherited_account,
                policy_secrets: &ego.stable_info.policy_secrets,
            },
        )
        .map_err(PolicyResolutionError::from)?;
        debug!(version = %policy.version, sponsor = %sponsor.peer_id, "resolved syncing policy");
        Ok(policy)
    }
}
